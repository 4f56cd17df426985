//! Inter-task messages for the task-based pipeline variant.
//!
//! Every queue is bounded (`PipelineConfig::queue_depth`); senders use
//! non-blocking `try_send` and log a dropped message on overflow, receivers
//! block until something arrives. Messages in one queue are delivered FIFO —
//! the two half-buffer notifications per capture cycle alternate 0/1 in
//! hardware transfer order, and reordering them would corrupt the overlap
//! continuity of the patch stream.

use serde::{Deserialize, Serialize};

/// Identifies one half of the ping-pong capture buffer.
pub type HalfIndex = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Message {
    /// One capture half-buffer is ready to be fed into the ring.
    DataReady { half: HalfIndex },
    /// Enough fresh samples have accumulated for one processing cycle.
    DataBuffReady,
    /// Begin acquisition (sent once at startup in the task variant).
    StartAcq,
    /// Flip the processing-enabled gate.
    ToggleProc,
    /// Start or stop synthetic load generation.
    GenerateLoad {
        time_slice_ms: u32,
        duty_cycle_pct: u8,
    },
    /// Load generator internal: begin a run.
    GenerateLoadStart,
    /// Load generator internal: perform one busy/sleep slice.
    GenerateLoadStep,
    /// Load generator internal: end the current run.
    GenerateLoadStop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUEUE_DEPTH;

    #[test]
    fn bounded_queue_preserves_fifo_order() {
        let (tx, rx) = crossbeam_channel::bounded::<Message>(QUEUE_DEPTH);
        tx.try_send(Message::DataReady { half: 0 }).unwrap();
        tx.try_send(Message::DataReady { half: 1 }).unwrap();
        tx.try_send(Message::DataBuffReady).unwrap();

        assert_eq!(rx.recv().unwrap(), Message::DataReady { half: 0 });
        assert_eq!(rx.recv().unwrap(), Message::DataReady { half: 1 });
        assert_eq!(rx.recv().unwrap(), Message::DataBuffReady);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (tx, _rx) = crossbeam_channel::bounded::<Message>(2);
        tx.try_send(Message::DataBuffReady).unwrap();
        tx.try_send(Message::DataBuffReady).unwrap();
        assert!(tx.try_send(Message::DataBuffReady).is_err());
    }

    #[test]
    fn message_serializes_with_tagged_kind() {
        let json = serde_json::to_value(Message::DataReady { half: 1 }).unwrap();
        assert_eq!(json["kind"], "dataReady");
        assert_eq!(json["half"], 1);

        let round_trip: Message = serde_json::from_value(json).unwrap();
        assert_eq!(round_trip, Message::DataReady { half: 1 });
    }
}
