use crate::core::interfaces::HmrNotifier;
use crate::core::models::HmrAsset;
use crate::utils::{KilnError, Logger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HmrMessage {
    Update { assets: Vec<HmrAsset> },
    Error {
        message: String,
        #[serde(default)]
        file: Option<PathBuf>,
        #[serde(default)]
        stack: Option<String>,
    },
}

/// Publishes HMR messages to in-process subscribers over a broadcast channel.
/// Whatever transport sits in front of the browser subscribes here.
pub struct BroadcastHmr {
    sender: broadcast::Sender<HmrMessage>,
    stopped: AtomicBool,
}

impl BroadcastHmr {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HmrMessage> {
        self.sender.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn publish(&self, message: HmrMessage) {
        if self.is_stopped() {
            return;
        }
        // No subscribers is not an error
        let delivered = self.sender.send(message).unwrap_or(0);
        Logger::debug(&format!("HMR message delivered to {} subscribers", delivered));
    }
}

impl Default for BroadcastHmr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HmrNotifier for BroadcastHmr {
    async fn emit_update(&self, assets: Vec<HmrAsset>) {
        if assets.is_empty() {
            return;
        }
        self.publish(HmrMessage::Update { assets });
    }

    async fn emit_error(&self, error: &KilnError) {
        self.publish(HmrMessage::Error {
            message: error.to_string(),
            file: error.file_path().map(|p| p.to_path_buf()),
            stack: Some(error.format_detailed()),
        });
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
