//! Receive side of a sequence channel.
//!
//! Every delivery method keeps a `window_start`: the oldest sequence number the
//! channel still waits for. Reliable methods additionally remember which later
//! sequence numbers already arrived in an `AckWindow` whose bit `i` stands for
//! `window_start + i`.

use sluice_core::ack_window::AckWindow;
use sluice_protocol::{
    delivery::DeliveryMethod,
    sequence::{next_sequence, relative_sequence_number, SequenceNumber},
};

/// What a receiver channel did with one message.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    /// Messages released to the application, in release order.
    Released(Vec<T>),
    /// Stored until the gap before it is filled.
    Withheld,
    /// A duplicate or a message older than what the channel already released.
    Dropped,
}

impl<T> Received<T> {
    fn single(item: T) -> Self {
        Received::Released(vec![item])
    }
}

/// Per-channel receive state.
#[derive(Debug)]
pub struct ReceiverChannel<T> {
    method: DeliveryMethod,
    window_size: usize,
    window_start: SequenceNumber,
    early_received: AckWindow,
    withheld: Vec<Option<T>>,
}

impl<T> ReceiverChannel<T> {
    /// Creates the receive state for `method`.
    pub fn new(method: DeliveryMethod) -> Self {
        let window_size = method.window_size();
        let (early_received, withheld) = match method {
            DeliveryMethod::ReliableUnordered => (AckWindow::new(window_size), Vec::new()),
            DeliveryMethod::ReliableOrdered => {
                (AckWindow::new(window_size), (0..window_size).map(|_| None).collect())
            }
            _ => (AckWindow::new(0), Vec::new()),
        };
        Self { method, window_size, window_start: 0, early_received, withheld }
    }

    /// Delivery method of this channel.
    pub fn method(&self) -> DeliveryMethod {
        self.method
    }

    /// Oldest sequence number the channel is still waiting for.
    pub fn window_start(&self) -> SequenceNumber {
        self.window_start
    }

    /// Number of messages held back by a gap.
    pub fn withheld_count(&self) -> usize {
        self.withheld.iter().filter(|slot| slot.is_some()).count()
    }

    /// Feeds one message with sequence number `sequence`.
    pub fn receive(&mut self, sequence: SequenceNumber, item: T) -> Received<T> {
        match self.method {
            DeliveryMethod::Unreliable => Received::single(item),
            DeliveryMethod::UnreliableSequenced | DeliveryMethod::ReliableSequenced => {
                self.receive_sequenced(sequence, item)
            }
            DeliveryMethod::ReliableUnordered => self.receive_unordered(sequence, item),
            DeliveryMethod::ReliableOrdered => self.receive_ordered(sequence, item),
        }
    }

    fn receive_sequenced(&mut self, sequence: SequenceNumber, item: T) -> Received<T> {
        if relative_sequence_number(sequence, self.window_start) < 0 {
            return Received::Dropped;
        }
        self.window_start = next_sequence(sequence);
        Received::single(item)
    }

    fn receive_unordered(&mut self, sequence: SequenceNumber, item: T) -> Received<T> {
        let relative = relative_sequence_number(sequence, self.window_start);
        if relative < 0 || relative as usize >= self.window_size {
            return Received::Dropped;
        }
        let relative = relative as usize;
        if self.early_received.get(relative) {
            return Received::Dropped;
        }
        if relative == 0 {
            self.advance(|_| {});
        } else {
            self.early_received.set(relative, true);
        }
        Received::single(item)
    }

    fn receive_ordered(&mut self, sequence: SequenceNumber, item: T) -> Received<T> {
        let relative = relative_sequence_number(sequence, self.window_start);
        if relative < 0 || relative as usize >= self.window_size {
            return Received::Dropped;
        }
        let relative = relative as usize;
        if self.early_received.get(relative) {
            return Received::Dropped;
        }
        if relative > 0 {
            self.early_received.set(relative, true);
            self.withheld[sequence as usize % self.window_size] = Some(item);
            return Received::Withheld;
        }

        let mut released = vec![item];
        let window_size = self.window_size;
        let withheld = &mut self.withheld;
        let early_received = &mut self.early_received;
        let mut window_start = self.window_start;
        Self::slide(early_received, &mut window_start, |start| {
            if let Some(next) = withheld[start as usize % window_size].take() {
                released.push(next);
            }
        });
        self.window_start = window_start;
        Received::Released(released)
    }

    /// Slides past the slot at `window_start` and every consecutive early arrival.
    fn advance(&mut self, on_slot: impl FnMut(SequenceNumber)) {
        Self::slide(&mut self.early_received, &mut self.window_start, on_slot);
    }

    fn slide(
        early_received: &mut AckWindow,
        window_start: &mut SequenceNumber,
        mut on_slot: impl FnMut(SequenceNumber),
    ) {
        early_received.set(0, false);
        early_received.rotate_down();
        *window_start = next_sequence(*window_start);
        while early_received.get(0) {
            on_slot(*window_start);
            early_received.set(0, false);
            early_received.rotate_down();
            *window_start = next_sequence(*window_start);
        }
    }
}
