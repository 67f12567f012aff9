//! Reports newly shared items.

use async_trait::async_trait;
use handoff_core::item::{ItemKind, SharedItem};
use handoff_core::poller::ShareNotifier;
use handoff_core::registry::ItemGroups;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Longest text preview written to the log.
const PREVIEW_CHARS: usize = 80;

/// Logs each delivery, optionally forwarding it for follow-up work such as
/// fetching the offered files.
#[derive(Debug, Default)]
pub struct LogNotifier {
    forward: Option<mpsc::UnboundedSender<ItemGroups>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also send every delivery to the returned receiver.
    pub fn forwarding() -> (Self, mpsc::UnboundedReceiver<ItemGroups>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { forward: Some(tx) }, rx)
    }
}

#[async_trait]
impl ShareNotifier for LogNotifier {
    async fn notify(&self, groups: ItemGroups) {
        for group in &groups.groups {
            info!("{} {} file(s) shared", group.items.len(), group.mime_type);
        }
        for item in &groups.individual {
            info!("Shared {}", describe(item));
        }

        if let Some(forward) = &self.forward {
            if forward.send(groups).is_err() {
                warn!("Share delivery dropped: nobody is listening");
            }
        }
    }
}

/// One-line human description of an item.
pub fn describe(item: &SharedItem) -> String {
    match item.kind {
        ItemKind::File => {
            let name = item.name.as_deref().unwrap_or("unnamed file");
            match item.size {
                Some(size) => format!("file {} ({} bytes)", name, size),
                None => format!("file {}", name),
            }
        }
        ItemKind::Text => {
            let text = item.text.as_deref().unwrap_or_default();
            let preview: String = text.chars().take(PREVIEW_CHARS).collect();
            if preview.len() < text.len() {
                format!("text: {}...", preview)
            } else {
                format!("text: {}", preview)
            }
        }
    }
}
