use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use futures::future::try_join_all;
use parley::storage::{MessageId, MessageRecord, MessageStore, NewUser, SqliteStorage, UserId, UserStore};
use parley::{
    Alert, BackoffConfig, ChatSession, ConversationView, EventHub, MessageService,
    SessionContext, SessionEvent,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct World {
    service: MessageService<SqliteStorage>,
    alice: UserId,
    bob: UserId,
    carol: UserId,
}

async fn world() -> World {
    let store = SqliteStorage::open(":memory:").await.expect("store opens");
    let mut ids = Vec::new();
    for (full_name, username) in [
        ("Alice Moreau", "amoreau"),
        ("Bob Tran", "btran"),
        ("Carol Diaz", "cdiaz"),
    ] {
        let user = store
            .create_user(NewUser::new(full_name, username).with_cohort("History", 2018))
            .await
            .expect("create user");
        ids.push(user.id);
    }

    let hub = EventHub::new(
        64,
        BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        },
    );
    World {
        service: MessageService::new(Arc::new(store), hub),
        alice: ids[0],
        bob: ids[1],
        carol: ids[2],
    }
}

async fn session_for(world: &World, viewer: UserId) -> ChatSession<SqliteStorage> {
    ChatSession::start(SessionContext { viewer }, world.service.clone(), None)
        .await
        .expect("session starts")
}

async fn wait_until<F>(session: &mut ChatSession<SqliteStorage>, mut done: F)
where
    F: FnMut(&ChatSession<SqliteStorage>, &SessionEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(3), session.next_event())
            .await
            .expect("event in time")
            .expect("event applies")
            .expect("inbox open");
        if done(session, &event) {
            return;
        }
    }
}

#[tokio::test]
async fn incoming_message_counts_unread_and_moves_sender_to_top() {
    let world = world().await;
    world
        .service
        .send(world.bob, world.carol, "earlier chat", None)
        .await
        .expect("seed carol contact");

    let mut bob = session_for(&world, world.bob).await;
    assert_eq!(bob.conversation_list("")[0].user.id, world.carol);

    world
        .service
        .send(world.alice, world.bob, "Hi", None)
        .await
        .expect("alice sends");
    wait_until(&mut bob, |_, event| {
        matches!(event, SessionEvent::MessageReceived(_))
    })
    .await;

    assert_eq!(bob.unread_count(world.alice), 1);
    let rows = bob.conversation_list("");
    assert_eq!(rows[0].user.id, world.alice);
    assert!(rows[0].has_new_activity);
    assert_eq!(rows[0].badge(), None);
    assert_eq!(rows[0].subtitle().as_deref(), Some("History · Class of 2018"));
}

#[tokio::test]
async fn opening_a_conversation_marks_it_read_idempotently() {
    let world = world().await;
    world
        .service
        .send(world.alice, world.bob, "Hi", None)
        .await
        .expect("alice sends");

    let mut bob = session_for(&world, world.bob).await;
    assert_eq!(bob.unread_count(world.alice), 1);

    bob.open_conversation(world.alice).await.expect("open");
    assert_eq!(bob.unread_count(world.alice), 0);
    assert!(!bob.list().has_new_activity(world.alice));

    let again = world
        .service
        .mark_read(world.bob, world.alice)
        .await
        .expect("second mark");
    assert_eq!(again.marked, 0);
    bob.reconcile().await.expect("reconcile");
    assert_eq!(bob.unread_count(world.alice), 0);
}

#[tokio::test]
async fn replies_are_annotated_for_both_parties() {
    let world = world().await;
    let mut alice = session_for(&world, world.alice).await;
    let mut bob = session_for(&world, world.bob).await;
    alice.open_conversation(world.bob).await.expect("alice opens");
    bob.open_conversation(world.alice).await.expect("bob opens");

    let hello = alice.send("Hello").await.expect("alice sends");
    wait_until(&mut bob, |session, _| {
        session
            .conversation()
            .and_then(|view| view.find(hello.id))
            .is_some()
    })
    .await;

    bob.reply_to(hello.id).expect("reply target loaded");
    let reply = bob.send("Hi back").await.expect("bob replies");
    assert_eq!(reply.reply_to, Some(hello.id));
    assert!(bob.conversation().and_then(|view| view.pending_reply()).is_none());

    wait_until(&mut alice, |session, _| {
        session
            .conversation()
            .and_then(|view| view.find(reply.id))
            .is_some()
    })
    .await;

    let now = Utc::now();
    for session in [&alice, &bob] {
        let model = session.conversation_model(&now).expect("conversation open");
        let entry = model.entry(reply.id).expect("reply rendered");
        let replied = entry.replied.as_ref().expect("reply resolved");
        assert_eq!(replied.content, "Hello");
    }
}

#[test]
fn messages_across_local_midnight_get_two_headers() {
    let alice = UserId::new(1);
    let bob = UserId::new(2);
    let at = |id: i64, rfc3339: &str| MessageRecord {
        id: MessageId::new(id),
        sender_id: alice,
        receiver_id: bob,
        content: format!("m{id}"),
        timestamp: DateTime::parse_from_rfc3339(rfc3339)
            .expect("fixture timestamp")
            .with_timezone(&Utc),
        reply_to: None,
        is_read: false,
    };

    let mut view = ConversationView::new(bob, alice);
    // 23:50 on Mar 4 and 00:10 on Mar 5 at -05:00.
    view.load_history([
        at(1, "2025-03-05T04:50:00Z"),
        at(2, "2025-03-05T05:10:00Z"),
    ]);

    let now = DateTime::<FixedOffset>::parse_from_rfc3339("2025-03-05T18:00:00-05:00")
        .expect("fixture now");
    assert_eq!(view.build(&now).labels(), vec!["Yesterday", "Today"]);
}

#[tokio::test]
async fn reconnect_reconciles_messages_missed_while_offline() {
    let world = world().await;
    let mut bob = session_for(&world, world.bob).await;

    world
        .service
        .send(world.alice, world.bob, "before", None)
        .await
        .expect("send before drop");
    wait_until(&mut bob, |_, event| {
        matches!(event, SessionEvent::MessageReceived(_))
    })
    .await;
    assert_eq!(bob.unread_count(world.alice), 1);

    world.service.hub().disconnect();
    try_join_all((0..3).map(|index| {
        let service = world.service.clone();
        let (alice, bob) = (world.alice, world.bob);
        async move { service.send(alice, bob, &format!("missed {index}"), None).await }
    }))
    .await
    .expect("writes while offline");
    assert_eq!(bob.unread_count(world.alice), 1);

    world.service.hub().reconnect();
    wait_until(&mut bob, |_, event| matches!(event, SessionEvent::Resynced)).await;

    let truth = world
        .service
        .store()
        .unread_counts(world.bob)
        .await
        .expect("unread counts");
    assert_eq!(truth.get(&world.alice).copied(), Some(4));
    assert_eq!(bob.unread_count(world.alice), 4);
    assert_eq!(bob.conversation_list("")[0].badge(), Some(4));
}

#[tokio::test]
async fn alerts_only_for_conversations_not_in_view() {
    let world = world().await;
    let (sink, mut alerts) = mpsc::unbounded_channel::<Alert>();
    let mut bob = ChatSession::start(
        SessionContext { viewer: world.bob },
        world.service.clone(),
        Some(Arc::new(sink)),
    )
    .await
    .expect("session starts");
    bob.open_conversation(world.alice).await.expect("open alice");

    world
        .service
        .send(world.alice, world.bob, "you are looking at me", None)
        .await
        .expect("alice sends");
    world
        .service
        .send(world.carol, world.bob, "over here", None)
        .await
        .expect("carol sends");

    let mut received = 0;
    wait_until(&mut bob, |_, event| {
        if matches!(event, SessionEvent::MessageReceived(_)) {
            received += 1;
        }
        received == 2
    })
    .await;

    let alert = timeout(Duration::from_secs(2), alerts.recv())
        .await
        .expect("alert in time")
        .expect("alert channel open");
    assert_eq!(alert.sender_id, world.carol);
    assert_eq!(alert.text, "New message from Carol Diaz");
    assert!(alerts.try_recv().is_err());
}
