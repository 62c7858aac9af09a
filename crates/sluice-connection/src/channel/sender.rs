//! Send side of a sequence channel.
//!
//! Sequence numbers between `window_start` and `send_start` are in flight. At most
//! `window_size` of them may be outstanding; further messages wait in `queued`
//! until an acknowledgment slides the window.
//!
//! Reliable channels keep every in-flight message until it is acknowledged and send
//! it again whenever its resend delay elapses. Unreliable channels keep nothing: an
//! acknowledgment only tells them the remote is keeping up, and an acknowledgment for
//! a later sequence also retires every earlier slot. An unreliable slot whose
//! acknowledgment has not arrived within the resend delay is retired as lost.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use sluice_core::{
    ack_window::AckWindow,
    message_pool::{MessagePool, SharedPayload},
};
use sluice_protocol::{
    delivery::{DeliveryMethod, MessageType},
    header::MessageHeader,
    sequence::{advance_sequence, next_sequence, relative_sequence_number, SequenceNumber},
};

/// Receipt shared by every fragment of one tagged message.
#[derive(Debug)]
pub struct ReceiptTracker {
    tag: u32,
    remaining: AtomicUsize,
}

impl ReceiptTracker {
    /// Tracks `parts` wire messages that must all be acknowledged.
    pub fn new(tag: u32, parts: usize) -> Arc<Self> {
        Arc::new(Self { tag, remaining: AtomicUsize::new(parts) })
    }

    /// Marks one part acknowledged; returns the tag when it was the last one.
    fn complete_part(&self) -> Option<u32> {
        (self.remaining.fetch_sub(1, Ordering::AcqRel) == 1).then_some(self.tag)
    }
}

/// A message waiting for a window slot.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Bytes to send (a whole message or one fragment with its prefix).
    pub payload: SharedPayload,
    /// Whether `payload` starts with a fragment header.
    pub is_fragment: bool,
    /// Receipt to complete when this part is acknowledged.
    pub receipt: Option<Arc<ReceiptTracker>>,
}

impl QueuedMessage {
    /// An untagged, unfragmented message.
    pub fn new(payload: SharedPayload) -> Self {
        Self { payload, is_fragment: false, receipt: None }
    }
}

/// One message put on the wire.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Header to write.
    pub header: MessageHeader,
    /// Payload to write after it.
    pub payload: SharedPayload,
}

#[derive(Debug)]
struct StoredMessage {
    message: QueuedMessage,
    sequence: SequenceNumber,
    last_sent: Instant,
}

/// Effect of one acknowledgment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckResult {
    /// Window slots that became free.
    pub freed: usize,
    /// Receipts completed by this acknowledgment.
    pub receipts: Vec<u32>,
}

/// Per-channel send state.
#[derive(Debug)]
pub struct SenderChannel {
    message_type: MessageType,
    method: DeliveryMethod,
    window_size: usize,
    window_start: SequenceNumber,
    send_start: SequenceNumber,
    queued: VecDeque<QueuedMessage>,
    stored: Vec<Option<StoredMessage>>,
    received_acks: AckWindow,
    flow_control: bool,
    // Send times of in-flight unreliable messages, oldest first.
    unreliable_sent: VecDeque<Instant>,
}

impl SenderChannel {
    /// Creates the send state for `method` on `channel`.
    ///
    /// Without `flow_control` an unreliable channel frees each slot as soon as the
    /// message is written, so it never waits for acknowledgments.
    pub fn new(method: DeliveryMethod, channel: u8, flow_control: bool) -> Self {
        let window_size = method.window_size();
        let reliable = method.is_reliable();
        Self {
            message_type: MessageType::User { method, channel },
            method,
            window_size,
            window_start: 0,
            send_start: 0,
            queued: VecDeque::new(),
            stored: if reliable { (0..window_size).map(|_| None).collect() } else { Vec::new() },
            received_acks: AckWindow::new(if reliable { window_size } else { 0 }),
            flow_control: reliable || flow_control,
            unreliable_sent: VecDeque::new(),
        }
    }

    /// Message type written in the header of every message on this channel.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Slots in the send window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Oldest unacknowledged sequence number.
    pub fn window_start(&self) -> SequenceNumber {
        self.window_start
    }

    /// Messages sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        relative_sequence_number(self.send_start, self.window_start) as usize
    }

    /// Messages waiting for a free slot.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Returns true if nothing is queued or awaiting acknowledgment.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight() == 0
    }

    /// Appends a message behind those already queued.
    pub fn enqueue(&mut self, message: QueuedMessage) {
        self.queued.push_back(message);
    }

    /// Moves queued messages into free window slots and writes them to `out`.
    ///
    /// Returns the number of slots freed right away, which only happens on
    /// unreliable channels running without flow control.
    pub fn send_queued(&mut self, time: Instant, out: &mut Vec<Transmission>) -> usize {
        let mut freed = 0;
        while self.in_flight() < self.window_size {
            let Some(message) = self.queued.pop_front() else {
                break;
            };
            let sequence = self.send_start;
            self.send_start = next_sequence(sequence);
            out.push(self.transmission(sequence, &message));

            if self.method.is_reliable() {
                let slot = sequence as usize % self.window_size;
                self.stored[slot] = Some(StoredMessage { message, sequence, last_sent: time });
            } else if self.flow_control {
                self.unreliable_sent.push_back(time);
            } else {
                self.window_start = self.send_start;
                freed += 1;
            }
        }
        freed
    }

    /// Writes every stored message whose resend delay elapsed to `out`.
    ///
    /// Returns the number of resent messages.
    pub fn resend_due(&mut self, time: Instant, delay: Duration, out: &mut Vec<Transmission>) -> usize {
        let message_type = self.message_type;
        let mut resent = 0;
        for stored in self.stored.iter_mut().flatten() {
            if time.saturating_duration_since(stored.last_sent) < delay {
                continue;
            }
            stored.last_sent = time;
            out.push(Transmission {
                header: MessageHeader {
                    message_type,
                    is_fragment: stored.message.is_fragment,
                    sequence: stored.sequence,
                    payload_bits: stored.message.payload.length_bits() as u16,
                },
                payload: stored.message.payload.clone(),
            });
            resent += 1;
        }
        if resent > 0 {
            tracing::trace!("Resent {} message(s) on {:?}", resent, message_type);
        }
        resent
    }

    /// Retires unreliable slots that went unacknowledged for `delay`.
    ///
    /// Unreliable messages are never resent, so a lost message or a lost
    /// acknowledgment would otherwise hold its slot forever. Returns the number
    /// of slots freed.
    pub fn expire_unacknowledged(&mut self, time: Instant, delay: Duration) -> usize {
        let mut freed = 0;
        while let Some(&sent) = self.unreliable_sent.front() {
            if time.saturating_duration_since(sent) < delay {
                break;
            }
            self.unreliable_sent.pop_front();
            self.window_start = next_sequence(self.window_start);
            freed += 1;
        }
        if freed > 0 {
            tracing::trace!("Retired {} unacknowledged message(s) on {:?}", freed, self.message_type);
        }
        freed
    }

    /// Applies an acknowledgment for `sequence`.
    ///
    /// Acknowledgments for sequence numbers outside the in-flight range are
    /// duplicates and change nothing.
    pub fn receive_ack(&mut self, sequence: SequenceNumber, pool: &MessagePool) -> AckResult {
        let relative = relative_sequence_number(sequence, self.window_start);
        if relative < 0 || relative as usize >= self.in_flight() {
            return AckResult::default();
        }
        let relative = relative as usize;

        if !self.method.is_reliable() {
            self.window_start = next_sequence(sequence);
            self.unreliable_sent.drain(..(relative + 1).min(self.unreliable_sent.len()));
            return AckResult { freed: relative + 1, receipts: Vec::new() };
        }

        let mut result = AckResult::default();
        let slot = sequence as usize % self.window_size;
        let matches = self.stored[slot].as_ref().is_some_and(|stored| stored.sequence == sequence);
        let stored = if matches { self.stored[slot].take() } else { None };
        if let Some(stored) = stored {
            if let Some(tag) = stored.message.receipt.as_ref().and_then(|receipt| receipt.complete_part()) {
                result.receipts.push(tag);
            }
            stored.message.payload.release(pool);
        }
        self.received_acks.set(relative, true);

        while self.received_acks.get(0) {
            self.received_acks.set(0, false);
            self.received_acks.rotate_down();
            self.window_start = next_sequence(self.window_start);
            result.freed += 1;
        }
        result
    }

    /// Returns every stored and queued payload to `pool`.
    pub fn release(&mut self, pool: &MessagePool) {
        for stored in self.stored.iter_mut().filter_map(Option::take) {
            stored.message.payload.release(pool);
        }
        for message in self.queued.drain(..) {
            message.payload.release(pool);
        }
        self.window_start = self.send_start;
        self.received_acks.clear();
        self.unreliable_sent.clear();
    }

    /// Sequence number that will be assigned `offset` messages from now.
    pub fn upcoming_sequence(&self, offset: usize) -> SequenceNumber {
        advance_sequence(self.send_start, offset)
    }

    fn transmission(&self, sequence: SequenceNumber, message: &QueuedMessage) -> Transmission {
        Transmission {
            header: MessageHeader {
                message_type: self.message_type,
                is_fragment: message.is_fragment,
                sequence,
                payload_bits: message.payload.length_bits() as u16,
            },
            payload: message.payload.clone(),
        }
    }
}
