//! Typed edges between tasks.
//!
//! An output channel has a name, a message type name, and a list of
//! recipients. Delivery duplicates the envelope per recipient (cheap, since
//! the payload is shared) and enqueues it on the recipient's input queue tagged
//! with the recipient's slot index. A channel also aggregates the using-data
//! state of its recipients, which the sending task consults to decide
//! whether there is any point doing work.

use crate::core::envelope::Envelope;
use crate::core::task::TaskShared;
use std::sync::Arc;

pub struct Recipient {
    pub task: Arc<TaskShared>,
    pub slot: usize,
}

pub struct OutputChannel {
    name: String,
    type_name: String,
    recipients: Vec<Recipient>,
}

impl OutputChannel {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            recipients: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn add_recipient(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }

    /// Fan the envelope out to every recipient. Succeeds only if every
    /// recipient accepted its duplicate.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        let mut ok = true;
        for recipient in &self.recipients {
            if !recipient.task.put(envelope.duplicate(), recipient.slot) {
                tracing::warn!(
                    channel = %self.name,
                    recipient = %recipient.task.name(),
                    "recipient rejected delivery"
                );
                ok = false;
            }
        }
        ok
    }

    pub fn any_recipients_using_data(&self) -> bool {
        self.recipients.iter().any(|r| r.task.is_using_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{QueueItem, TaskShared};
    use crate::messages::video::Video;

    fn envelope(seq: u32) -> Envelope {
        Envelope::wrap_native(Arc::new(Video::with_samples("t", seq, 0.0, vec![1])))
    }

    fn drain(rx: &flume::Receiver<QueueItem>) -> Vec<(u32, usize)> {
        let mut seen = Vec::new();
        while let Ok(QueueItem::Envelope { envelope, slot }) = rx.try_recv() {
            seen.push((envelope.native().unwrap().header().sequence(), slot));
        }
        seen
    }

    #[test]
    fn deliver_fans_out_in_order_to_every_recipient() {
        let (a, a_rx) = TaskShared::new("a", true);
        let (b, b_rx) = TaskShared::new("b", true);

        let mut channel = OutputChannel::new("0-0", "Video");
        channel.add_recipient(Recipient { task: a, slot: 0 });
        channel.add_recipient(Recipient { task: b, slot: 2 });

        for seq in 1..=3 {
            assert!(channel.deliver(&envelope(seq)));
        }

        assert_eq!(drain(&a_rx), vec![(1, 0), (2, 0), (3, 0)]);
        assert_eq!(drain(&b_rx), vec![(1, 2), (2, 2), (3, 2)]);
    }

    #[test]
    fn deliver_fails_when_any_recipient_is_deactivated() {
        let (a, _a_rx) = TaskShared::new("a", true);
        let (b, _b_rx) = TaskShared::new("b", true);
        b.deactivate();

        let mut channel = OutputChannel::new("0-0", "Video");
        channel.add_recipient(Recipient {
            task: a.clone(),
            slot: 0,
        });
        channel.add_recipient(Recipient { task: b, slot: 0 });

        assert!(!channel.deliver(&envelope(1)));
        // The healthy recipient still got its copy.
        assert_eq!(a.queue_len(), 1);
    }
}
