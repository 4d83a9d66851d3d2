//! End-to-end session scenarios, driven directly against [`Connection`]
//! rather than over a real socket: the event loop's only job once bytes
//! are read is to feed them through `drain_messages`, so exercising the
//! connection closure this way covers the same behavior a live TCP
//! client would see.

use auditlogd::codec::{self, Decoded};
use auditlogd::connection::Connection;
use auditlogd::sink::local::{LocalSink, RandomDrop};
use auditlogd::state::State;
use auditlogd::wire::{ClientMessage, InfoMessage, InfoValue, ServerMessage, StreamId, TimeSpec};

fn tempdir(label: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!(
        "auditlogd-scenario-{label}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos()
    ));
    p
}

fn local_connection(root: &std::path::Path) -> Connection {
    let sink = LocalSink::new(root.to_path_buf(), 0o600, RandomDrop::none());
    Connection::new("127.0.0.1:9".into(), Box::new(sink), false)
}

/// Drain every `ServerMessage` currently queued for the client.
fn drain_replies(conn: &mut Connection) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while conn.has_pending_writes() {
        let frame = {
            let buf = conn.write_queue().front_mut().unwrap();
            buf.unconsumed().to_vec()
        };
        match codec::decode::<ServerMessage>(&frame).unwrap() {
            Decoded::Message { value, consumed } => {
                conn.write_queue().front_mut().unwrap().advance(consumed);
                let mut pool = std::mem::take(conn.buffer_pool());
                conn.write_queue().pop_drained(&mut pool);
                *conn.buffer_pool() = pool;
                out.push(value);
            }
            Decoded::NeedMore => break,
        }
    }
    out
}

/// Happy path, local-only, I/O logged.
#[test]
fn scenario_happy_path_local_io_logged() {
    let root = tempdir("happy");
    let mut conn = local_connection(&root);
    conn.send_hello("Sudo Audit Server <test>").unwrap();

    let accept = ClientMessage::Accept {
        submit_time: TimeSpec::new(1_700_000_000, 0),
        info_msgs: vec![
            InfoMessage {
                key: "user".into(),
                value: InfoValue::Text("alice".into()),
            },
            InfoMessage {
                key: "command".into(),
                value: InfoValue::Text("/bin/ls".into()),
            },
        ],
        expect_iobufs: true,
    };
    let frame = codec::encode(&accept).unwrap();
    feed(&mut conn, &frame);

    let io = ClientMessage::IoBuffer {
        stream: StreamId::TtyOut,
        delay: TimeSpec::new(0, 100_000_000),
        data: b"hello\n".to_vec(),
    };
    feed(&mut conn, &codec::encode(&io).unwrap());

    let exit = ClientMessage::Exit {
        exit_value: 0,
        run_time: TimeSpec::new(3, 0),
        signal: None,
        dumped_core: false,
    };
    feed(&mut conn, &codec::encode(&exit).unwrap());
    assert_eq!(conn.state(), State::Exited);

    let final_commit = conn.emit_scheduled_commit().unwrap();
    assert!(final_commit.close_after_drain);
    assert_eq!(conn.state(), State::Finished);

    let replies = drain_replies(&mut conn);
    assert!(matches!(replies[0], ServerMessage::ServerHello { .. }));
    assert!(replies.iter().any(|m| matches!(m, ServerMessage::LogId { .. })));
    match replies.last().unwrap() {
        ServerMessage::CommitPoint { time } => assert_eq!(*time, TimeSpec::new(3, 0)),
        other => panic!("expected a final CommitPoint, got {other:?}"),
    }

    let _ = std::fs::remove_dir_all(&root);
}

/// Rejected session -- no `LogId`, no `CommitPoint`, connection closes.
#[test]
fn scenario_rejected() {
    let root = tempdir("rejected");
    let mut conn = local_connection(&root);
    conn.send_hello("Sudo Audit Server <test>").unwrap();

    let reject = ClientMessage::Reject {
        reason: "policy denied".into(),
        submit_time: TimeSpec::ZERO,
        info_msgs: vec![InfoMessage {
            key: "user".into(),
            value: InfoValue::Text("bob".into()),
        }],
    };
    let outcome = feed(&mut conn, &codec::encode(&reject).unwrap());
    assert!(outcome.close_after_drain);
    assert_eq!(conn.state(), State::Finished);

    let replies = drain_replies(&mut conn);
    assert!(matches!(replies[0], ServerMessage::ServerHello { .. }));
    assert!(!replies.iter().any(|m| matches!(m, ServerMessage::LogId { .. })));
    assert!(!replies.iter().any(|m| matches!(m, ServerMessage::CommitPoint { .. })));

    let _ = std::fs::remove_dir_all(&root);
}

/// Out-of-order `Accept` then `Restart` is a protocol error.
#[test]
fn scenario_out_of_order_restart() {
    let root = tempdir("outoforder");
    let mut conn = local_connection(&root);

    feed(
        &mut conn,
        &codec::encode(&ClientMessage::Accept {
            submit_time: TimeSpec::ZERO,
            info_msgs: vec![],
            expect_iobufs: false,
        })
        .unwrap(),
    );

    let outcome = feed(
        &mut conn,
        &codec::encode(&ClientMessage::Restart {
            log_id: "whatever".into(),
            restart_time: TimeSpec::ZERO,
        })
        .unwrap(),
    );
    assert!(outcome.close_after_drain);
    assert_eq!(conn.state(), State::Error);

    let replies = drain_replies(&mut conn);
    match replies.last().unwrap() {
        ServerMessage::Error { reason } => assert_eq!(reason, "state machine error"),
        other => panic!("expected Error reply, got {other:?}"),
    }

    let _ = std::fs::remove_dir_all(&root);
}

/// An over-size length prefix is rejected at the codec before
/// any payload is even parsed.
#[test]
fn scenario_oversize_frame_is_a_protocol_error() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0x0010_0000u32.to_be_bytes());
    buf.extend(std::iter::repeat(0u8).take(1024 * 1024));
    let err = codec::decode::<ClientMessage>(&buf).unwrap_err();
    assert_eq!(err.category(), "protocol");
    assert!(err.to_string().contains("too large"));
}

/// Store-first with relay journals the full transcript, and a separate
/// replay step drains it. The journal file's contents must match
/// byte-for-byte what a direct local connection logs.
#[test]
fn scenario_store_first_journals_full_transcript() {
    let root = tempdir("journal");
    let journal_dir = root.join("_journal");
    let mut sink = auditlogd::sink::journal::JournalSink::create(&journal_dir).unwrap();
    use auditlogd::sink::Sink;

    sink.accept(
        TimeSpec::new(1_700_000_000, 0),
        &[InfoMessage {
            key: "user".into(),
            value: InfoValue::Text("alice".into()),
        }],
        true,
    )
    .unwrap();
    sink.iobuf(StreamId::TtyOut, TimeSpec::new(0, 100_000_000), b"hello\n")
        .unwrap();
    sink.exit(0, TimeSpec::new(3, 0), None, false).unwrap();

    let bytes = std::fs::read(sink.path()).unwrap();
    let mut offset = 0;
    let mut decoded = Vec::new();
    while offset < bytes.len() {
        match codec::decode::<ClientMessage>(&bytes[offset..]).unwrap() {
            Decoded::Message { value, consumed } => {
                decoded.push(value);
                offset += consumed;
            }
            Decoded::NeedMore => panic!("journal should contain only complete frames"),
        }
    }
    assert_eq!(decoded.len(), 3);
    assert!(matches!(decoded[0], ClientMessage::Accept { .. }));
    assert!(matches!(decoded[1], ClientMessage::IoBuffer { .. }));
    assert!(matches!(decoded[2], ClientMessage::Exit { .. }));

    let _ = std::fs::remove_dir_all(&root);
}

fn feed(conn: &mut Connection, frame: &[u8]) -> auditlogd::connection::DispatchOutcome {
    conn.ensure_read_capacity(frame.len());
    conn.read_spare_mut()[..frame.len()].copy_from_slice(frame);
    conn.read_commit(frame.len());
    conn.drain_messages().unwrap().pop().expect("one message was fed")
}
