//! Connection closure: owns the per-session read buffer, write queue,
//! state machine, and bound sink. The event loop in `server.rs` feeds it
//! raw bytes and drains its write queue; every other decision lives here.

use crate::buffer::{BufferPool, ConnBuf, WriteQueue};
use crate::codec::{self, Decoded};
use crate::error::{Error, Result};
use crate::sink::{AcceptOutcome, Sink};
use crate::state::{State, Transition};
use crate::wire::{ClientMessage, ServerMessage, TimeSpec};

const INITIAL_READ_CAPACITY: usize = 4096;

/// What the event loop should do after processing a message or a timer
/// firing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOutcome {
    /// The read side should be deregistered; the connection is done
    /// producing new work (terminal state or a fatal error).
    pub deregister_read: bool,
    /// Once the write queue drains, the socket should be closed.
    pub close_after_drain: bool,
    /// A payload-bearing message succeeded; arm the commit timer unless a
    /// relay is attached.
    pub arm_commit: bool,
}

impl DispatchOutcome {
    fn none() -> Self {
        Self::default()
    }

    fn terminal() -> Self {
        Self {
            deregister_read: true,
            close_after_drain: true,
            arm_commit: false,
        }
    }
}

pub struct Connection {
    pub peer_addr: String,
    state: State,
    read_buf: ConnBuf,
    write_queue: WriteQueue,
    pool: BufferPool,
    sink: Box<dyn Sink>,
    has_relay: bool,
    log_io: bool,
    last_commit: TimeSpec,
    error: Option<String>,
}

impl Connection {
    pub fn new(peer_addr: String, sink: Box<dyn Sink>, has_relay: bool) -> Self {
        Self {
            peer_addr,
            state: State::Initial,
            read_buf: ConnBuf::from_bytes(vec![0u8; INITIAL_READ_CAPACITY]),
            write_queue: WriteQueue::new(),
            pool: BufferPool::new(),
            sink,
            has_relay,
            log_io: false,
            last_commit: TimeSpec::ZERO,
            error: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn has_relay(&self) -> bool {
        self.has_relay
    }

    pub fn log_io(&self) -> bool {
        self.log_io
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn write_queue(&mut self) -> &mut WriteQueue {
        &mut self.write_queue
    }

    pub fn buffer_pool(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Capacity the event loop should read into next: grows the buffer if
    /// fewer than `min_spare` bytes remain uncommitted.
    pub fn ensure_read_capacity(&mut self, min_spare: usize) {
        let spare = self.read_buf.capacity() - self.read_buf.len();
        if spare < min_spare {
            self.read_buf.grow_to(self.read_buf.len() + min_spare);
        }
    }

    pub fn read_spare_mut(&mut self) -> &mut [u8] {
        self.read_buf.spare_mut()
    }

    pub fn read_commit(&mut self, n: usize) {
        self.read_buf.commit(n);
    }

    pub fn send_hello(&mut self, server_id: &str) -> Result<()> {
        self.enqueue_reply(&ServerMessage::ServerHello {
            server_id: server_id.to_string(),
        })
    }

    fn enqueue_reply(&mut self, msg: &ServerMessage) -> Result<()> {
        let frame = codec::encode(msg)?;
        let mut buf = self.pool.get_free_buf(frame.len())?;
        buf.append(&frame);
        self.write_queue.push(buf);
        Ok(())
    }

    /// Process every complete frame currently buffered, in arrival order,
    /// stopping early once the connection reaches a terminal or errored
    /// state. Leaves any partial trailing frame in place.
    pub fn drain_messages(&mut self) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match codec::decode::<ClientMessage>(self.read_buf.unconsumed())? {
                Decoded::Message { value, consumed } => {
                    self.read_buf.advance(consumed);
                    let outcome = self.on_message(value)?;
                    let stop = outcome.deregister_read;
                    outcomes.push(outcome);
                    if stop {
                        break;
                    }
                }
                Decoded::NeedMore => {
                    self.grow_for_pending_prefix();
                    break;
                }
            }
        }
        self.read_buf.compact();
        Ok(outcomes)
    }

    /// If a full length prefix is buffered but its body isn't, grow the
    /// read buffer so the next read can complete the frame in one pass
    ///.
    fn grow_for_pending_prefix(&mut self) {
        let buf = self.read_buf.unconsumed();
        if buf.len() < codec::PREFIX_LEN {
            return;
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let needed = codec::PREFIX_LEN + len;
        if needed > self.read_buf.capacity() {
            self.read_buf.grow_to(needed);
        }
    }

    fn on_message(&mut self, msg: ClientMessage) -> Result<DispatchOutcome> {
        if !self.state.accepts(&msg) {
            return Ok(self.fail("state machine error"));
        }
        let kind = msg.kind_name();

        match msg {
            ClientMessage::ClientHello { client_id } => {
                tracing::debug!(peer = %self.peer_addr, client_id = %client_id, "client hello");
                Ok(DispatchOutcome::none())
            }

            ClientMessage::Accept {
                submit_time,
                info_msgs,
                expect_iobufs,
            } => {
                match self.sink.accept(submit_time, &info_msgs, expect_iobufs) {
                    Ok(AcceptOutcome::LogId(id)) => self.enqueue_reply(&ServerMessage::LogId { id })?,
                    Ok(AcceptOutcome::Deferred) => {}
                    Err(e) => return Ok(self.fail_sink(e)),
                }
                self.log_io = expect_iobufs;
                self.state = self
                    .state
                    .advance(Transition::Accept)
                    .expect("accepts() already validated this transition");
                Ok(DispatchOutcome::none())
            }

            ClientMessage::Reject {
                reason,
                submit_time,
                info_msgs,
            } => {
                if let Err(e) = self.sink.reject(&reason, submit_time, &info_msgs) {
                    return Ok(self.fail_sink(e));
                }
                self.state = self
                    .state
                    .advance(Transition::Reject)
                    .expect("accepts() already validated this transition");
                Ok(DispatchOutcome::terminal())
            }

            ClientMessage::Exit {
                exit_value,
                run_time,
                signal,
                dumped_core,
            } => {
                if let Err(e) = self.sink.exit(exit_value, run_time, signal.as_deref(), dumped_core) {
                    return Ok(self.fail_sink(e));
                }
                self.last_commit = self.last_commit.max(run_time);
                let transition = if self.log_io && !self.has_relay {
                    Transition::ExitAwaitingCommit
                } else {
                    Transition::ExitImmediate
                };
                self.state = self
                    .state
                    .advance(transition)
                    .expect("accepts() already validated this transition");
                Ok(DispatchOutcome {
                    deregister_read: true,
                    close_after_drain: self.state.is_terminal(),
                    arm_commit: false,
                })
            }

            ClientMessage::Restart { log_id, restart_time } => {
                if let Err(e) = self.sink.restart(&log_id, restart_time) {
                    return Ok(self.fail(&format!("restart failed: {e}")));
                }
                self.state = self
                    .state
                    .advance(Transition::Restart)
                    .expect("accepts() already validated this transition");
                self.log_io = true;
                Ok(DispatchOutcome::none())
            }

            ClientMessage::Alert {
                reason,
                alert_time,
                info_msgs,
            } => {
                if let Err(e) = self.sink.alert(&reason, alert_time, &info_msgs) {
                    return Ok(self.fail_sink(e));
                }
                Ok(DispatchOutcome::none())
            }

            ClientMessage::IoBuffer { stream, delay, data } => {
                if let Err(e) = self.sink.iobuf(stream, delay, &data) {
                    return Ok(self.fail_sink(e));
                }
                self.last_commit = self.last_commit.max(delay);
                Ok(DispatchOutcome {
                    arm_commit: !self.has_relay,
                    ..DispatchOutcome::none()
                })
            }

            ClientMessage::ChangeWindowSize { rows, cols, delay } => {
                if let Err(e) = self.sink.winsize(rows, cols, delay) {
                    return Ok(self.fail_sink(e));
                }
                self.last_commit = self.last_commit.max(delay);
                Ok(DispatchOutcome {
                    arm_commit: !self.has_relay,
                    ..DispatchOutcome::none()
                })
            }

            ClientMessage::CommandSuspend { signal, delay } => {
                if let Err(e) = self.sink.suspend(&signal, delay) {
                    return Ok(self.fail_sink(e));
                }
                self.last_commit = self.last_commit.max(delay);
                Ok(DispatchOutcome {
                    arm_commit: !self.has_relay,
                    ..DispatchOutcome::none()
                })
            }
        }
        .map(|outcome| {
            tracing::trace!(peer = %self.peer_addr, kind, state = ?self.state, "dispatched");
            outcome
        })
    }

    /// Emit a commit-point reply for `elapsed`, driving the
    /// `EXITED -> FINISHED` transition if this is the final one.
    pub fn emit_commit_point(&mut self, elapsed: TimeSpec) -> Result<DispatchOutcome> {
        self.last_commit = elapsed;
        self.enqueue_reply(&ServerMessage::CommitPoint { time: elapsed })?;
        if self.state == State::Exited {
            self.state = self
                .state
                .advance(Transition::FinalCommitDelivered)
                .expect("Exited always accepts FinalCommitDelivered");
            return Ok(DispatchOutcome::terminal());
        }
        Ok(DispatchOutcome::none())
    }

    /// Emit a commit point for the connection's own tracked durable
    /// elapsed time, as the scheduler does when the commit timer fires.
    pub fn emit_scheduled_commit(&mut self) -> Result<DispatchOutcome> {
        self.emit_commit_point(self.last_commit)
    }

    /// Pass a relay's reply through to the real downstream client,
    /// converting `CommitPoint` through the same state-machine path a
    /// locally-scheduled commit would take.
    pub fn forward_relay_reply(&mut self, msg: ServerMessage) -> Result<DispatchOutcome> {
        match msg {
            ServerMessage::CommitPoint { time } => self.emit_commit_point(time),
            other => {
                self.enqueue_reply(&other)?;
                Ok(DispatchOutcome::none())
            }
        }
    }

    /// Force the connection into `SHUTDOWN`.
    pub fn begin_shutdown(&mut self) -> DispatchOutcome {
        self.state = self
            .state
            .advance(Transition::Shutdown)
            .unwrap_or(State::Shutdown);
        DispatchOutcome {
            deregister_read: true,
            close_after_drain: self.write_queue.is_empty(),
            arm_commit: false,
        }
    }

    fn fail(&mut self, reason: &str) -> DispatchOutcome {
        self.state = self
            .state
            .advance(Transition::ProtocolError)
            .unwrap_or(State::Error);
        self.error = Some(reason.to_string());
        let _ = self.enqueue_reply(&ServerMessage::Error {
            reason: reason.to_string(),
        });
        tracing::warn!(peer = %self.peer_addr, reason, "connection failed");
        DispatchOutcome::terminal()
    }

    fn fail_sink(&mut self, err: Error) -> DispatchOutcome {
        self.state = self
            .state
            .advance(Transition::ProtocolError)
            .unwrap_or(State::Error);
        self.error = Some(err.to_string());
        if err.wants_reply() {
            let _ = self.enqueue_reply(&ServerMessage::Error {
                reason: err.to_string(),
            });
        }
        tracing::warn!(peer = %self.peer_addr, error = %err, category = err.category(), "sink failure");
        DispatchOutcome::terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::local::{LocalSink, RandomDrop};
    use crate::wire::{InfoMessage, InfoValue, StreamId};
    use std::path::PathBuf;

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "auditlogd-connection-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        p
    }

    fn local_conn() -> (Connection, PathBuf) {
        let root = tempdir();
        let sink = LocalSink::new(root.clone(), 0o600, RandomDrop::none());
        (Connection::new("127.0.0.1:9".into(), Box::new(sink), false), root)
    }

    #[test]
    fn happy_path_emits_log_id_then_commit_then_finishes() {
        let (mut conn, root) = local_conn();
        let accept = conn
            .on_message(ClientMessage::Accept {
                submit_time: TimeSpec::new(1_700_000_000, 0),
                info_msgs: vec![InfoMessage {
                    key: "user".into(),
                    value: InfoValue::Text("alice".into()),
                }],
                expect_iobufs: true,
            })
            .unwrap();
        assert!(!accept.deregister_read);
        assert_eq!(conn.state(), State::Running);

        let io = conn
            .on_message(ClientMessage::IoBuffer {
                stream: StreamId::TtyOut,
                delay: TimeSpec::new(0, 100_000_000),
                data: b"hello\n".to_vec(),
            })
            .unwrap();
        assert!(io.arm_commit);

        let exit = conn
            .on_message(ClientMessage::Exit {
                exit_value: 0,
                run_time: TimeSpec::new(3, 0),
                signal: None,
                dumped_core: false,
            })
            .unwrap();
        assert!(exit.deregister_read);
        assert_eq!(conn.state(), State::Exited);

        let commit = conn.emit_scheduled_commit().unwrap();
        assert!(commit.close_after_drain);
        assert_eq!(conn.state(), State::Finished);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn accept_without_iobufs_sends_no_log_id() {
        let (mut conn, root) = local_conn();
        conn.on_message(ClientMessage::Accept {
            submit_time: TimeSpec::ZERO,
            info_msgs: vec![],
            expect_iobufs: false,
        })
        .unwrap();
        assert!(!conn.has_pending_writes(), "no LogId reply expected");
        assert_eq!(conn.state(), State::Running);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn out_of_order_restart_after_accept_is_a_protocol_error() {
        let (mut conn, root) = local_conn();
        conn.on_message(ClientMessage::Accept {
            submit_time: TimeSpec::ZERO,
            info_msgs: vec![],
            expect_iobufs: false,
        })
        .unwrap();

        let outcome = conn
            .on_message(ClientMessage::Restart {
                log_id: "x".into(),
                restart_time: TimeSpec::ZERO,
            })
            .unwrap();
        assert!(outcome.deregister_read);
        assert_eq!(conn.state(), State::Error);
        assert!(conn.error().is_some());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn reject_closes_without_log_id() {
        let (mut conn, root) = local_conn();
        let outcome = conn
            .on_message(ClientMessage::Reject {
                reason: "policy denied".into(),
                submit_time: TimeSpec::ZERO,
                info_msgs: vec![],
            })
            .unwrap();
        assert!(outcome.close_after_drain);
        assert_eq!(conn.state(), State::Finished);
        assert!(conn.has_pending_writes());

        let _ = std::fs::remove_dir_all(&root);
    }
}
