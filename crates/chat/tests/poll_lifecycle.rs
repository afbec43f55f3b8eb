use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pollbot_chat::commands::{CommandRouter, IdGenerator};
use pollbot_chat::events::{
    ChatEvent, CommandMessageHandler, DispatchOutcome, EventContext, EventDispatcher,
    MessageSender, PostedMessage, SendError,
};
use pollbot_core::domain::poll::PollId;
use pollbot_db::{connect_with_settings, migrations, SqlPollRepository};

const BOT_USER: &str = "bot-user";
const CHANNEL: &str = "town-square";

struct FixedId;

impl IdGenerator for FixedId {
    fn next_id(&self) -> PollId {
        PollId("3f1c2a9e-7b4d-4c1e-9a55-0d8e6b2f4a10".to_owned())
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    fn last(&self) -> String {
        let sent = self.sent.lock().expect("sent lock");
        let (channel, text) = sent.last().cloned().expect("a reply was sent");
        assert_eq!(channel, CHANNEL);
        text
    }

    fn count(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        self.sent.lock().expect("sent lock").push((channel_id.to_owned(), text.to_owned()));
        Ok(())
    }
}

struct Harness {
    dispatcher: EventDispatcher,
    sender: Arc<RecordingSender>,
    posts: usize,
}

impl Harness {
    async fn new() -> Self {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let repository = Arc::new(SqlPollRepository::new(pool));
        let router = Arc::new(CommandRouter::with_id_generator(repository, Arc::new(FixedId)));
        let sender = Arc::new(RecordingSender::default());

        let mut dispatcher = EventDispatcher::new(sender.clone());
        dispatcher.register(CommandMessageHandler::new(BOT_USER, router));

        Self { dispatcher, sender, posts: 0 }
    }

    async fn post(&mut self, author: &str, text: &str) -> String {
        self.posts += 1;
        let event = ChatEvent::Posted(PostedMessage {
            post_id: format!("post-{}", self.posts),
            author_id: author.to_owned(),
            channel_id: CHANNEL.to_owned(),
            text: text.to_owned(),
        });
        let ctx = EventContext { correlation_id: format!("post-{}", self.posts) };

        let outcome = self.dispatcher.dispatch(&event, &ctx).await;
        assert_eq!(outcome, DispatchOutcome::Replied, "`{text}` should be answered");
        self.sender.last()
    }
}

#[tokio::test]
async fn poll_lifecycle_against_sqlite() {
    let mut harness = Harness::new().await;
    let id = FixedId.next_id();

    let created = harness.post("alice", "/create_vote \"Best color?\" red blue").await;
    assert_eq!(created, format!("Vote created with ID: {id}\nOptions: red, blue"));

    assert_eq!(
        harness.post("bob", &format!("/vote {id} red")).await,
        "Vote for red recorded successfully!"
    );
    harness.post("carol", &format!("/vote {id} red")).await;
    harness.post("dave", &format!("/vote {id} blue")).await;

    let results = harness.post("erin", &format!("/results {id}")).await;
    assert_eq!(
        results,
        format!(
            "**Results for vote {id}**\nBest color?\n- red: 2\n- blue: 1\nStatus: active (3 votes total)"
        )
    );

    let rejected = harness.post("frank", &format!("/vote {id} green")).await;
    assert_eq!(
        rejected,
        "**Error:** failed to record vote: option `green` is not part of this vote"
    );

    assert_eq!(
        harness.post("alice", &format!("/end_vote {id}")).await,
        format!("Vote {id} has been ended")
    );

    let late = harness.post("grace", &format!("/vote {id} blue")).await;
    assert!(late.starts_with("**Error:** failed to record vote:"), "{late}");

    let again = harness.post("alice", &format!("/end_vote {id}")).await;
    assert!(again.contains("already ended"), "{again}");

    let final_results = harness.post("erin", &format!("/results {id}")).await;
    assert!(final_results.contains("- red: 2\n- blue: 1\nStatus: ended"), "{final_results}");

    assert_eq!(
        harness.post("alice", &format!("/delete_vote {id}")).await,
        format!("Vote {id} deleted successfully")
    );
    assert_eq!(
        harness.post("erin", &format!("/results {id}")).await,
        format!("**Error:** failed to fetch results: vote ID `{id}` not found")
    );
    assert_eq!(
        harness.post("alice", &format!("/delete_vote {id}")).await,
        format!("**Error:** failed to delete vote: vote ID `{id}` not found")
    );
}

#[tokio::test]
async fn bot_messages_and_chatter_get_no_reply() {
    let mut harness = Harness::new().await;
    harness.post("alice", "/create_vote Lunch? tacos ramen").await;
    let before = harness.sender.count();

    for (author, text) in [(BOT_USER, "/results anything"), ("bob", "lunch at noon?")] {
        let event = ChatEvent::Posted(PostedMessage {
            post_id: "quiet".to_owned(),
            author_id: author.to_owned(),
            channel_id: CHANNEL.to_owned(),
            text: text.to_owned(),
        });
        let outcome = harness.dispatcher.dispatch(&event, &EventContext::default()).await;
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
    }

    assert_eq!(harness.sender.count(), before);
}
