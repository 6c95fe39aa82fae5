use cncstream_communication::{
    BufferedStreamer, Connection, LineSource, LoopbackConnection, LoopbackHandle, ResponseSink,
    StreamerConfig, StreamerEvent,
};
use cncstream_core::Command;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;

fn open_streamer(buffer_size: usize, single_step: bool) -> (BufferedStreamer, LoopbackHandle) {
    let (mut conn, handle) = LoopbackConnection::new();
    let sink: Arc<dyn ResponseSink> = Arc::new(|_: &str| {});
    conn.open("loop", 115200, sink).unwrap();
    let streamer = BufferedStreamer::new(
        Box::new(conn),
        StreamerConfig {
            buffer_size,
            single_step,
        },
    );
    (streamer, handle)
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(String),
    Stream(Vec<String>),
    Ack,
}

fn command_text() -> impl Strategy<Value = String> {
    "G[0-3] X[0-9]{1,6}"
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => command_text().prop_map(Op::Enqueue),
        1 => prop::collection::vec(command_text(), 1..6).prop_map(Op::Stream),
        3 => Just(Op::Ack),
    ]
}

/// Apply pump events to the model of the active list
fn record(events: Vec<StreamerEvent>, active: &mut VecDeque<String>) {
    for event in events {
        if let StreamerEvent::Sent(command) = event {
            active.push_back(command.text);
        }
    }
}

proptest! {
    #[test]
    fn prop_buffer_never_overflows_and_acks_are_fifo(
        buffer_size in 16usize..96,
        single_step in any::<bool>(),
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let (mut streamer, wire) = open_streamer(buffer_size, single_step);
        let mut active: VecDeque<String> = VecDeque::new();

        for op in ops {
            match op {
                Op::Enqueue(text) => streamer.enqueue_command(Command::new(text)),
                Op::Stream(lines) => streamer.enqueue_stream(Box::new(LineSource::new(lines))),
                Op::Ack => {
                    let acked = streamer.acknowledge().map(|c| c.text);
                    prop_assert_eq!(acked, active.pop_front());
                }
            }
            record(streamer.pump().unwrap(), &mut active);

            let outstanding: usize = active.iter().map(|t| t.len() + 1).sum();
            prop_assert!(streamer.sent_buffer_size() <= buffer_size);
            prop_assert_eq!(streamer.sent_buffer_size(), outstanding);
            prop_assert_eq!(streamer.active_count(), active.len());
            if single_step {
                prop_assert!(streamer.active_count() <= 1);
            }
        }

        // Drain everything that is left.
        while streamer.has_active_commands() || !streamer.is_drained() {
            let acked = streamer.acknowledge().map(|c| c.text);
            prop_assert_eq!(acked, active.pop_front());
            record(streamer.pump().unwrap(), &mut active);
        }
        prop_assert_eq!(streamer.sent_buffer_size(), 0);
        prop_assert_eq!(streamer.active_count(), 0);
        prop_assert!(active.is_empty());
        prop_assert!(wire.written_bytes().is_empty());
    }

    #[test]
    fn prop_direct_commands_go_before_stream(
        buffer_size in 16usize..64,
        direct in prop::collection::vec(command_text(), 1..8),
        stream in prop::collection::vec(command_text(), 1..8),
    ) {
        let (mut streamer, wire) = open_streamer(buffer_size, false);
        let stream: Vec<String> = stream.into_iter().map(|t| format!("{} S", t)).collect();
        streamer.enqueue_stream(Box::new(LineSource::new(stream.clone())));
        for text in &direct {
            streamer.enqueue_command(Command::new(text.clone()));
        }

        streamer.pump().unwrap();
        while streamer.acknowledge().is_some() {
            streamer.pump().unwrap();
        }

        let mut expected = direct.clone();
        expected.extend(stream);
        prop_assert_eq!(wire.written_lines(), expected);
    }
}

#[test]
fn test_ack_frees_exactly_the_command_length() {
    let (mut streamer, _wire) = open_streamer(10, false);
    streamer.enqueue_command(Command::new("G1X1"));
    streamer.enqueue_command(Command::new("G1Y10"));
    streamer.pump().unwrap();
    assert_eq!(streamer.sent_buffer_size(), 5);
    assert_eq!(streamer.buffer_usage_percent(), 50);
    streamer.acknowledge();
    assert_eq!(streamer.sent_buffer_size(), 0);
    streamer.pump().unwrap();
    assert_eq!(streamer.sent_buffer_size(), 6);
}

#[test]
fn test_oversized_command_is_rejected() {
    let (mut streamer, wire) = open_streamer(8, false);
    streamer.enqueue_command(Command::new("G1 X100 Y100"));
    streamer.enqueue_command(Command::new("G0 X1"));
    let events = streamer.pump().unwrap();
    assert!(matches!(&events[0], StreamerEvent::Rejected(c) if c.text == "G1 X100 Y100"));
    assert_eq!(wire.written_lines(), vec!["G0 X1"]);
}
