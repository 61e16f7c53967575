mod common;

use common::{Network, expect_event, trust};
use kirc_relay::LOCKED_PLACEHOLDER;
use kirc_types::events::RelayEvent;

#[tokio::test]
async fn untrusted_requester_gets_history_in_the_clear() {
    let net = Network::new();
    let alice = net.node("alice");
    let bob = net.node("bob");
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    alice.join_channel("general").await.unwrap();
    for i in 0..20 {
        alice.send_chat("general", &format!("message {}", i)).await.unwrap();
    }

    let mut bob_events = bob.events();
    let history = bob.open_channel("general").await.unwrap();
    let expected: Vec<String> = alice
        .channel_messages("general", 50)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    let received: Vec<String> = history.iter().map(|m| m.content.clone()).collect();
    assert_eq!(received.len(), 20);
    assert_eq!(received, expected);
    assert_eq!(received[0], "message 0");

    match expect_event(&mut bob_events, |e| matches!(e, RelayEvent::HistoryLoaded { .. })).await {
        RelayEvent::HistoryLoaded { is_encrypted, messages, .. } => {
            assert!(!is_encrypted);
            assert_eq!(messages.len(), 20);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn trusted_requester_gets_a_sealed_page() {
    let net = Network::new();
    let alice = net.node("alice");
    let bob = net.node("bob");
    trust(&alice, &bob).await;
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    alice.join_channel("general").await.unwrap();
    for i in 0..5 {
        alice.send_chat("general", &format!("message {}", i)).await.unwrap();
    }

    let mut bob_events = bob.events();
    let history = bob.open_channel("general").await.unwrap();
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|m| !m.locked));

    match expect_event(&mut bob_events, |e| matches!(e, RelayEvent::HistoryLoaded { .. })).await {
        RelayEvent::HistoryLoaded { is_encrypted, .. } => assert!(is_encrypted),
        other => panic!("unexpected event: {:?}", other),
    }

    let stored = bob.channel_messages("general", 50).await.unwrap();
    let contents: Vec<_> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
    );
    assert!(stored.iter().all(|m| !m.is_outbound));
}

#[tokio::test]
async fn history_unlocks_messages_received_without_a_key() {
    let net = Network::new();
    let alice = net.node("alice");
    let bob = net.node("bob");
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    alice.join_channel("general").await.unwrap();
    bob.open_channel("general").await.unwrap();

    let mut bob_events = bob.events();
    alice.send_chat("general", "for your eyes only").await.unwrap();
    expect_event(&mut bob_events, |e| {
        matches!(e, RelayEvent::MessageRendered(msg) if msg.locked)
    })
    .await;
    let stored = bob.channel_messages("general", 10).await.unwrap();
    assert_eq!(stored[0].content, LOCKED_PLACEHOLDER);

    // Once the leader knows bob, history carries the plaintext
    trust(&alice, &bob).await;
    let history = bob.fetch_history("general").await.unwrap();
    assert_eq!(history[0].content, "for your eyes only");

    let stored = bob.channel_messages("general", 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "for your eyes only");
}
