//! Thread and attachment lifetimes across relay and clients
//!
//! Every participant shares one simulated clock, so deadlines fire at the
//! same instant everywhere once ticked.

use std::time::Duration;

use bytes::Bytes;
use luckyones_core::{
    Admission, CoreError, DeleteReason, ParticipantId, RouterAction, ThreadId, ThreadKind,
};
use luckyones_harness::{ClientHandle, SimInstant, SimNetwork};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

fn closed(actions: &[RouterAction<SimInstant>], thread: ThreadId) -> Option<DeleteReason> {
    actions.iter().find_map(|action| match action {
        RouterAction::ThreadClosed { thread: id, reason } if *id == thread => Some(*reason),
        _ => None,
    })
}

fn open_public(net: &mut SimNetwork, owner: ClientHandle) -> ThreadId {
    let (thread, actions) =
        net.router(owner).unwrap().create_thread(ThreadKind::Public, "lounge", &[]).unwrap();
    net.submit(owner, actions).unwrap();
    thread
}

#[test]
fn public_thread_lives_exactly_twelve_hours() {
    let mut net = SimNetwork::new(1);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let thread = open_public(&mut net, alice);
    net.take_inbox(bob).unwrap();

    net.advance(11 * HOUR + 59 * MINUTE);
    net.tick_all().unwrap();
    assert!(net.relay().threads().contains(thread));
    assert!(net.router(alice).unwrap().registry().contains(thread));
    assert!(net.router(bob).unwrap().registry().contains(thread));

    net.advance(MINUTE + Duration::from_secs(1));
    net.tick_all().unwrap();
    assert!(!net.relay().threads().contains(thread));
    assert!(!net.router(alice).unwrap().registry().contains(thread));
    assert!(!net.router(bob).unwrap().registry().contains(thread));

    let bob_inbox = net.take_inbox(bob).unwrap();
    assert_eq!(closed(&bob_inbox, thread), Some(DeleteReason::Expired));
    let count = bob_inbox
        .iter()
        .filter(|action| matches!(action, RouterAction::ThreadClosed { .. }))
        .count();
    assert_eq!(count, 1, "relay notice and local deadline must close the thread once");
}

#[test]
fn main_thread_never_expires() {
    let mut net = SimNetwork::new(2);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();

    net.advance(30 * 24 * HOUR);
    net.tick_all().unwrap();

    let actions = net.router(alice).unwrap().send_text(ThreadId::MAIN, "a month later").unwrap();
    net.submit(alice, actions).unwrap();
    assert_eq!(net.take_delivered(bob).unwrap().len(), 1);
}

#[test]
fn posting_after_expiry_is_rejected_locally() {
    let mut net = SimNetwork::new(3);
    let alice = net.connect("alice").unwrap();
    let _bob = net.connect("bob").unwrap();
    let thread = open_public(&mut net, alice);

    // Deadline passed but nobody has ticked yet.
    net.advance(12 * HOUR);
    let result = net.router(alice).unwrap().send_text(thread, "too late");
    assert_eq!(
        result.unwrap_err(),
        CoreError::Rejected { thread, admission: Admission::RejectedExpired }
    );
}

#[test]
fn attachment_in_main_is_purged_after_thirty_minutes() {
    let mut net = SimNetwork::new(4);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();

    let (attachment, actions) = net
        .router(alice)
        .unwrap()
        .send_image(ThreadId::MAIN, Bytes::from_static(b"snapshot"))
        .unwrap();
    net.submit(alice, actions).unwrap();
    net.take_inbox(bob).unwrap();

    net.advance(29 * MINUTE);
    net.tick_all().unwrap();
    assert!(net.router(bob).unwrap().store().contains(attachment));
    assert!(net.relay().threads().tracked_attachments() > 0);

    net.advance(MINUTE);
    net.tick_all().unwrap();
    assert!(!net.router(alice).unwrap().store().contains(attachment));
    assert!(!net.router(bob).unwrap().store().contains(attachment));
    assert_eq!(net.relay().threads().tracked_attachments(), 0);

    let inbox = net.take_inbox(bob).unwrap();
    assert_eq!(inbox, vec![RouterAction::AttachmentPurged(attachment)]);

    // A later tick finds nothing left to purge.
    net.advance(HOUR);
    net.tick_all().unwrap();
    assert!(net.take_inbox(bob).unwrap().is_empty());
    assert_eq!(net.router(bob).unwrap().store().purged(), 1);
}

#[test]
fn closing_a_thread_purges_its_attachments_early() {
    let mut net = SimNetwork::new(5);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let thread = open_public(&mut net, alice);

    let (attachment, actions) =
        net.router(alice).unwrap().send_image(thread, Bytes::from_static(b"pic")).unwrap();
    net.submit(alice, actions).unwrap();
    assert!(net.router(bob).unwrap().store().contains(attachment));

    let actions = net.router(alice).unwrap().delete_thread(thread).unwrap();
    net.submit(alice, actions).unwrap();
    assert!(!net.router(bob).unwrap().store().contains(attachment));
    assert!(!net.router(alice).unwrap().store().contains(attachment));

    let inbox = net.take_inbox(bob).unwrap();
    assert_eq!(closed(&inbox, thread), Some(DeleteReason::Explicit));

    // The attachment deadline still fires but has nothing to do.
    net.advance(31 * MINUTE);
    net.tick_all().unwrap();
    assert!(net.take_inbox(bob).unwrap().is_empty());
    assert_eq!(net.router(bob).unwrap().store().purged(), 1);
}

#[test]
fn deleting_twice_is_a_no_op() {
    let mut net = SimNetwork::new(6);
    let alice = net.connect("alice").unwrap();
    let thread = open_public(&mut net, alice);

    let first = net.router(alice).unwrap().delete_thread(thread).unwrap();
    assert_eq!(closed(&first, thread), Some(DeleteReason::Explicit));
    net.submit(alice, first).unwrap();

    let second = net.router(alice).unwrap().delete_thread(thread).unwrap();
    assert!(second.is_empty());
}

#[test]
fn only_the_creator_may_delete() {
    let mut net = SimNetwork::new(7);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let thread = open_public(&mut net, alice);

    let result = net.router(bob).unwrap().delete_thread(thread);
    assert!(matches!(result, Err(CoreError::Forbidden(_))));

    let result = net.router(alice).unwrap().delete_thread(ThreadId::MAIN);
    assert!(matches!(result, Err(CoreError::Forbidden(_))));
}

#[test]
fn private_thread_excludes_outsiders() {
    let mut net = SimNetwork::new(8);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let carol = net.connect("carol").unwrap();
    let bob_id = net.participant(bob).unwrap();
    let carol_id = net.participant(carol).unwrap();

    let (thread, actions) = net
        .router(alice)
        .unwrap()
        .create_thread(ThreadKind::Private, "secret", &[bob_id])
        .unwrap();
    net.submit(alice, actions).unwrap();

    assert!(net.router(bob).unwrap().registry().contains(thread));
    assert!(!net.router(carol).unwrap().registry().contains(thread));
    assert!(!net.relay().threads().is_member(thread, carol_id));

    let actions = net.router(alice).unwrap().send_text(thread, "just us").unwrap();
    assert_eq!(actions.len(), 1);
    net.submit(alice, actions).unwrap();
    assert_eq!(net.take_delivered(bob).unwrap().len(), 1);
    assert!(net.take_delivered(carol).unwrap().is_empty());

    let result = net.router(carol).unwrap().send_text(thread, "let me in");
    assert!(matches!(result, Err(CoreError::Rejected { .. })));

    // A late joiner is never added to a private thread.
    let dave = net.connect("dave").unwrap();
    let dave_id: ParticipantId = net.participant(dave).unwrap();
    assert!(!net.relay().threads().is_member(thread, dave_id));
    assert!(!net.router(dave).unwrap().registry().contains(thread));
}
