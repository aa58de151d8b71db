//! Fuzz target for the relay driver
//!
//! Arbitrary connection churn, frames and clock movement against one
//! driver.
//!
//! # Invariants
//!
//! - Driver never panics
//! - Every send targets a connection that is currently open
//! - The main thread always exists
//! - No non-main thread outlives its twelve-hour deadline past a tick

#![no_main]

use std::{collections::BTreeSet, time::Duration};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use luckyones_core::{CoreConfig, ThreadId};
use luckyones_harness::SimEnv;
use luckyones_proto::{Frame, FrameHeader, Opcode};
use luckyones_server::{RelayAction, RelayConfig, RelayDriver, RelayEvent};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Connect(u8),
    Disconnect(u8),
    Frame { connection: u8, opcode: u16, thread: u8, sender: u64, recipient: u64, body: Vec<u8> },
    Advance(u16),
    Tick,
}

fuzz_target!(|ops: Vec<Op>| {
    let env = SimEnv::with_seed(0);
    let config = RelayConfig { max_connections: 8, ..Default::default() };
    let driver = RelayDriver::new(env.clone(), config);
    let mut open: BTreeSet<u64> = BTreeSet::new();

    for op in ops.into_iter().take(256) {
        let result = match op {
            Op::Connect(id) => {
                let connection_id = u64::from(id);
                let result = driver.process_event(RelayEvent::ConnectionAccepted { connection_id });
                if matches!(&result, Ok(actions) if actions.is_empty()) {
                    open.insert(connection_id);
                }
                result
            },
            Op::Disconnect(id) => {
                let connection_id = u64::from(id);
                open.remove(&connection_id);
                driver.process_event(RelayEvent::ConnectionClosed {
                    connection_id,
                    reason: "fuzz".to_string(),
                })
            },
            Op::Frame { connection, opcode, thread, sender, recipient, body } => {
                let Some(opcode) = Opcode::from_u16(opcode) else {
                    continue;
                };
                let header = FrameHeader::routed(opcode, u128::from(thread), sender, recipient);
                let frame = Frame::new(header, body);
                driver.process_event(RelayEvent::FrameReceived {
                    connection_id: u64::from(connection),
                    frame,
                })
            },
            Op::Advance(minutes) => {
                env.advance(Duration::from_secs(u64::from(minutes) * 60));
                continue;
            },
            Op::Tick => {
                let result = driver.process_event(RelayEvent::Tick);
                let ttl = CoreConfig::default().thread_ttl;
                for id in 1..=u8::MAX {
                    if let Some(snapshot) = driver.threads().snapshot(ThreadId(u128::from(id))) {
                        assert!(env.elapsed() < snapshot.created_at.elapsed() + ttl);
                    }
                }
                result
            },
        };

        if let Ok(actions) = result {
            for action in actions {
                if let RelayAction::SendToConnection { connection_id, .. } = action {
                    assert!(open.contains(&connection_id), "send to closed connection");
                }
            }
        }
        assert!(driver.threads().contains(ThreadId::MAIN));
    }
});
