//! Application state: store, correlator, scheduler and the chat front end

use anyhow::{Context as _, Result};
use lanwatch_chat::{ChatId, ChatTransport, Dispatcher, TelegramTransport};
use lanwatch_core::{Detection, DeviceRegistry, HardwareId, JsonStore, Store};
use lanwatch_discovery::{Correlator, ScanBackend, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, TelegramConfig};
use crate::conversation::{Action, LanWatchDialog};

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub backend: Arc<dyn ScanBackend>,
    pub correlator: Arc<Correlator>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Open the data directory and build the scan pipeline
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(
            JsonStore::open(&config.daemon.data_dir).with_context(|| {
                format!("Failed to open data directory {}", config.daemon.data_dir.display())
            })?,
        );
        let backend = config.build_backend()?;
        let correlator = Arc::new(Correlator::new(store.clone()));
        let scheduler = Arc::new(Scheduler::new(
            backend.clone(),
            correlator.clone(),
            config.scheduler_config(),
        ));

        Ok(Self {
            config,
            store,
            backend,
            correlator,
            scheduler,
        })
    }

    /// Run one scan without recording it
    pub async fn scan_once(&self) -> Result<Vec<(Detection, Option<String>)>> {
        let timeout = Duration::from_secs(self.config.daemon.scan_timeout_secs);
        let detections = tokio::time::timeout(timeout, self.backend.scan())
            .await
            .context("Scan timed out")??;

        let mut named = Vec::with_capacity(detections.len());
        for detection in detections {
            let hardware_id = HardwareId::from_detection(&detection.hardware_id);
            let name = self
                .store
                .find_by_hardware_id(&hardware_id)?
                .map(|d| d.display_name().to_string());
            named.push((detection, name));
        }
        Ok(named)
    }

    /// Scan on schedule and serve the chat front end until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let Some(telegram) = self.config.telegram.clone() else {
            anyhow::bail!("a [telegram] section is required to run the daemon");
        };

        let transport = Arc::new(
            TelegramTransport::new(&telegram.token, Duration::from_secs(telegram.poll_timeout_secs))
                .context("Failed to create Telegram client")?,
        );
        let dispatcher = build_dispatcher(
            self.store.clone(),
            &self.correlator,
            transport.clone(),
            &telegram,
        )?;

        let alerts = forward_alerts(&self.correlator, dispatcher.clone(), telegram.admin_chat);
        let scheduler = self.scheduler.clone().start()?;

        info!(
            admin_chat = telegram.admin_chat,
            allowed = telegram.chats().len(),
            "LAN Watch running"
        );

        tokio::select! {
            _ = transport.run_polling(dispatcher) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutting down");
            }
        }

        scheduler.stop().await;
        alerts.abort();
        Ok(())
    }
}

/// Dialog and dispatcher with the configured chats allowed
pub fn build_dispatcher(
    store: Arc<dyn Store>,
    correlator: &Arc<Correlator>,
    transport: Arc<dyn ChatTransport>,
    telegram: &TelegramConfig,
) -> Result<Arc<Dispatcher<LanWatchDialog>>> {
    let dialog = Arc::new(LanWatchDialog::new(store, correlator.clone())?);
    let dispatcher = Arc::new(Dispatcher::new(dialog, transport));
    for chat in telegram.chats() {
        dispatcher.allow(chat);
    }
    Ok(dispatcher)
}

/// Route new-device events into the admin chat.
///
/// The correlator callback only enqueues; a separate task delivers.
pub fn forward_alerts(
    correlator: &Correlator,
    dispatcher: Arc<Dispatcher<LanWatchDialog>>,
    admin_chat: ChatId,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    correlator.set_new_device_alert(move |event| {
        if tx.send(event).is_err() {
            warn!("Alert channel closed, dropping new-device alert");
        }
    });

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = dispatcher
                .trigger(admin_chat, Action::NewDeviceAlert(event))
                .await
            {
                error!(chat_id = admin_chat, error = %e, "Failed to deliver new-device alert");
            }
        }
    })
}
