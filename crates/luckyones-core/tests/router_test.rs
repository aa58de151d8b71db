//! Message router behavior between live peers
//!
//! Direct router-to-router exchanges cover reordering and replay; the
//! simulated network covers the full path through the relay.

use bytes::Bytes;
use luckyones_core::{
    CoreConfig, DeliveredContent, Environment, MemoryAttachmentStore, MessageRouter, Notice,
    ParticipantId, RouterAction, ThreadId, ThreadKind,
};
use luckyones_crypto::{KeyPair, PublicKey};
use luckyones_harness::{SimEnv, SimInstant, SimNetwork, SimRouter};
use luckyones_proto::{Frame, FrameHeader, Join, Opcode, ParticipantInfo, Payload, UserList};

fn router(env: &SimEnv, name: &str) -> SimRouter {
    let identity = KeyPair::from_secret_bytes(env.random_key());
    let store = MemoryAttachmentStore::new();
    MessageRouter::new(env.clone(), identity, name, CoreConfig::default(), store)
}

fn frames(actions: Vec<RouterAction<SimInstant>>) -> Vec<Frame> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            RouterAction::Send(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

fn texts(actions: &[RouterAction<SimInstant>]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|action| match action {
            RouterAction::Deliver(message) => match &message.content {
                DeliveredContent::Text(text) => Some(text.clone()),
                DeliveredContent::Image { .. } => None,
            },
            _ => None,
        })
        .collect()
}

/// Two routers that have seen each other's JOIN.
fn introduced(env: &SimEnv) -> (SimRouter, SimRouter) {
    let alice = router(env, "alice");
    let bob = router(env, "bob");
    for frame in frames(alice.join_network().unwrap()) {
        bob.handle_frame(&frame).unwrap();
    }
    for frame in frames(bob.join_network().unwrap()) {
        alice.handle_frame(&frame).unwrap();
    }
    (alice, bob)
}

#[test]
fn out_of_order_messages_each_deliver_once() {
    let env = SimEnv::with_seed(1);
    let (alice, bob) = introduced(&env);

    let sent: Vec<Frame> = (0..3)
        .flat_map(|i| frames(alice.send_text(ThreadId::MAIN, &format!("m{i}")).unwrap()))
        .collect();
    assert_eq!(sent.len(), 3);

    let mut delivered = Vec::new();
    for index in [2, 0, 1] {
        delivered.extend(texts(&bob.handle_frame(&sent[index]).unwrap()));
    }
    assert_eq!(delivered, vec!["m2", "m0", "m1"]);

    let replay = bob.handle_frame(&sent[1]).unwrap();
    assert!(texts(&replay).is_empty());

    let stats = bob.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.undecryptable, 0);
}

#[test]
fn conversation_in_both_directions() {
    let env = SimEnv::with_seed(2);
    let (alice, bob) = introduced(&env);

    for round in 0..4 {
        for frame in frames(alice.send_text(ThreadId::MAIN, &format!("a{round}")).unwrap()) {
            assert_eq!(texts(&bob.handle_frame(&frame).unwrap()), vec![format!("a{round}")]);
        }
        for frame in frames(bob.send_text(ThreadId::MAIN, &format!("b{round}")).unwrap()) {
            assert_eq!(texts(&alice.handle_frame(&frame).unwrap()), vec![format!("b{round}")]);
        }
    }
}

#[test]
fn tampered_header_is_undecryptable_and_session_survives() {
    let env = SimEnv::with_seed(3);
    let (alice, bob) = introduced(&env);

    let mut sent = frames(alice.send_text(ThreadId::MAIN, "hello").unwrap());
    let original = sent.remove(0);

    // Re-addressing the frame to another thread breaks the bound context.
    let mut moved = original.clone();
    moved.header.set_thread_id(0x99);
    let actions = bob.handle_frame(&moved).unwrap();
    assert!(texts(&actions).is_empty());
    assert!(actions.iter().any(|a| matches!(a, RouterAction::Notice(Notice::Rejected { .. }))));

    let mut corrupted = original.clone();
    let mut payload = corrupted.payload.to_vec();
    let last = payload.len() - 1;
    payload[last] ^= 0x01;
    corrupted = Frame::new(corrupted.header, payload);
    let actions = bob.handle_frame(&corrupted).unwrap();
    assert!(texts(&actions).is_empty());
    assert_eq!(bob.stats().undecryptable, 1);

    assert_eq!(texts(&bob.handle_frame(&original).unwrap()), vec!["hello"]);
}

#[test]
fn frames_for_someone_else_are_ignored() {
    let env = SimEnv::with_seed(4);
    let (alice, bob) = introduced(&env);

    let mut frame = frames(alice.send_text(ThreadId::MAIN, "hi").unwrap()).remove(0);
    frame.header.set_recipient_id(0x1234);
    assert!(bob.handle_frame(&frame).unwrap().is_empty());
}

#[test]
fn text_reaches_every_main_member_through_relay() {
    let mut net = SimNetwork::new(10);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let carol = net.connect("carol").unwrap();

    let actions = net.router(alice).unwrap().send_text(ThreadId::MAIN, "hello all").unwrap();
    assert_eq!(actions.len(), 2);
    net.submit(alice, actions).unwrap();

    let alice_id = net.participant(alice).unwrap();
    for peer in [bob, carol] {
        let delivered = net.take_delivered(peer).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].sender, alice_id);
        assert_eq!(delivered[0].content, DeliveredContent::Text("hello all".to_string()));
    }
    assert!(net.take_delivered(alice).unwrap().is_empty());
}

#[test]
fn late_joiner_learns_existing_peers_and_threads() {
    let mut net = SimNetwork::new(11);
    let alice = net.connect("alice").unwrap();
    let (thread, actions) =
        net.router(alice).unwrap().create_thread(ThreadKind::Public, "general", &[]).unwrap();
    net.submit(alice, actions).unwrap();

    let bob = net.connect("bob").unwrap();
    let bob_router = net.router(bob).unwrap();
    let peers = bob_router.peers();
    assert_eq!(peers, vec![(net.participant(alice).unwrap(), "alice".to_string())]);
    assert!(bob_router.registry().is_member(thread, net.participant(bob).unwrap()));

    let opened = net.take_inbox(bob).unwrap();
    assert!(opened.iter().any(|a| matches!(a, RouterAction::ThreadOpened(s) if s.id == thread)));
}

#[test]
fn image_is_delivered_and_stored_by_recipient() {
    let mut net = SimNetwork::new(12);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();

    let picture = Bytes::from_static(b"\x89PNG not really");
    let (attachment, actions) =
        net.router(alice).unwrap().send_image(ThreadId::MAIN, picture.clone()).unwrap();
    net.submit(alice, actions).unwrap();

    let delivered = net.take_delivered(bob).unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].content, DeliveredContent::Image { attachment, bytes: picture });
    assert!(net.router(bob).unwrap().store().contains(attachment));
    assert!(net.router(alice).unwrap().store().contains(attachment));
}

#[test]
fn departed_peer_is_no_longer_addressed() {
    let mut net = SimNetwork::new(13);
    let alice = net.connect("alice").unwrap();
    let bob = net.connect("bob").unwrap();
    let carol = net.connect("carol").unwrap();

    net.disconnect(carol).unwrap();

    let actions = net.router(alice).unwrap().send_text(ThreadId::MAIN, "still here?").unwrap();
    assert_eq!(actions.len(), 1);
    net.submit(alice, actions).unwrap();
    assert_eq!(net.take_delivered(bob).unwrap().len(), 1);
}

#[test]
fn low_order_keys_are_never_learned() {
    let env = SimEnv::with_seed(8);
    let (alice, bob) = introduced(&env);

    let mut order_four = [0u8; 32];
    order_four[0] = 1;
    let id_of = |bytes: [u8; 32]| ParticipantId::from_public_key(&PublicKey::from_bytes(bytes)).0;

    let join = Join { public_key: [0; 32], username: "zero".to_string(), thread_id: None };
    let header = FrameHeader::routed(Opcode::Join, 0, id_of([0; 32]), FrameHeader::BROADCAST);
    alice.handle_frame(&Payload::Join(join).into_frame(header).unwrap()).unwrap();

    let list = UserList {
        participants: vec![ParticipantInfo {
            id: id_of(order_four),
            public_key: order_four,
            username: "four".to_string(),
        }],
    };
    let header = FrameHeader::routed(Opcode::UserList, 0, 0, alice.participant_id().0);
    alice.handle_frame(&Payload::UserList(list).into_frame(header).unwrap()).unwrap();

    assert_eq!(alice.peers(), vec![(bob.participant_id(), "bob".to_string())]);
    let sent = frames(alice.send_text(ThreadId::MAIN, "still here").unwrap());
    assert_eq!(sent.len(), 1);
    assert_eq!(texts(&bob.handle_frame(&sent[0]).unwrap()), vec!["still here"]);
}
