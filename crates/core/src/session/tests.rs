use super::*;
use crate::dialogue::{Message, Role, ToolCall};
use crate::providers::{LlmChunk, ToolDefinition, TtsProvider};
use crate::test_support::{FakeAsr, FakeConnection, FakeTts, Script, ScriptedLlm, wait_until};
use crate::tools::{MockToolExecutor, ToolAction, ToolRegistry};
use mockall::predicate::eq;
use serde_json::json;
use std::time::Duration;

struct Harness {
    session: Arc<Session>,
    conn: Arc<FakeConnection>,
    asr: Arc<FakeAsr>,
    llm: Arc<ScriptedLlm>,
    tts: Arc<FakeTts>,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(config: SessionConfig, scripts: Vec<Script>) -> Self {
        Self::start_with_tools(config, scripts, Arc::new(ToolRegistry::new()))
    }

    fn start_with_tools(
        config: SessionConfig,
        scripts: Vec<Script>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        let conn = Arc::new(FakeConnection::new());
        let asr = Arc::new(FakeAsr::default());
        let llm = Arc::new(ScriptedLlm::new(scripts));
        let tts = Arc::new(FakeTts::default());
        let providers = ProviderSet {
            asr: asr.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
        };
        let session = Session::new(
            "test-session",
            Some("aa:bb".into()),
            conn.clone(),
            config,
            providers,
            tools,
            Arc::default(),
            None,
        );
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.handle().await })
        };
        Self {
            session,
            conn,
            asr,
            llm,
            tts,
            task,
        }
    }

    async fn wait_for_stops(&self, count: usize) {
        wait_until("tts stop", || {
            self.conn.tts_states().iter().filter(|s| *s == "stop").count() >= count
        })
        .await;
    }

    async fn shutdown(self) {
        self.conn.hang_up();
        tokio::time::timeout(Duration::from_secs(3), self.task)
            .await
            .expect("session did not stop")
            .unwrap()
            .unwrap();
    }
}

fn config(mode: ListenMode) -> SessionConfig {
    SessionConfig {
        listen_mode: mode,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_auto_mode_dispatches_immediately() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::text("Turning on the light now.")],
    );

    assert!(h.asr.emit("turn on the light").await);
    h.wait_for_stops(1).await;

    assert_eq!(h.conn.stt_texts(), vec!["turn on the light"]);
    assert_eq!(
        h.conn.tts_states(),
        vec!["start", "sentence_start", "sentence_end", "stop"]
    );
    assert_eq!(h.conn.spoken_sentences(), vec!["Turning on the light now."]);
    assert_eq!(h.conn.binary_count(), 1);

    let calls = h.llm.calls();
    assert_eq!(calls.len(), 1);
    let last = calls[0].last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, "turn on the light");

    // The recognizer is re-armed once the reply has been delivered.
    wait_until("recognizer reset", || h.asr.reset_count() >= 1).await;
    let history = h.session.history().await;
    assert_eq!(history.last().unwrap().content, "Turning on the light now.");
    h.shutdown().await;
}

#[tokio::test]
async fn test_result_before_read_loop_is_answered() {
    let h = Harness::start(config(ListenMode::Auto), vec![Script::text("It is noon.")]);

    // The session task has not been polled yet.
    assert!(h.asr.emit("what time is it").await);
    assert_eq!(h.conn.stt_texts(), vec!["what time is it"]);
    assert!(!h.session.is_closed());

    h.wait_for_stops(1).await;
    assert_eq!(h.conn.spoken_sentences(), vec!["It is noon."]);
    assert_eq!(h.conn.close_count(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn test_auto_mode_ignores_empty_results() {
    let h = Harness::start(config(ListenMode::Auto), vec![]);
    assert!(!h.asr.emit("").await);
    assert!(!h.asr.emit("   ").await);
    assert!(h.conn.stt_texts().is_empty());
    assert_eq!(h.session.talk_round(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn test_manual_mode_dispatches_on_stop() {
    let h = Harness::start(config(ListenMode::Auto), vec![Script::text("Hi!")]);
    h.conn
        .push_json(json!({"type": "listen", "state": "start", "mode": "manual"}));
    wait_until("listen start", || h.session.listen_mode() == ListenMode::Manual).await;

    assert!(!h.asr.emit("hello").await);
    assert!(!h.asr.emit(" world").await);
    assert!(h.conn.stt_texts().is_empty());

    h.conn.push_json(json!({"type": "listen", "state": "stop"}));
    h.wait_for_stops(1).await;

    assert_eq!(h.conn.stt_texts(), vec!["hello world"]);
    assert_eq!(h.llm.calls().len(), 1);
    assert_eq!(h.session.talk_round(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_manual_stop_without_text_cancels() {
    let h = Harness::start(config(ListenMode::Manual), vec![]);
    h.conn.push_json(json!({"type": "listen", "state": "stop"}));
    h.wait_for_stops(1).await;

    assert!(h.conn.stt_texts().is_empty());
    assert!(h.llm.calls().is_empty());
    assert_eq!(h.session.talk_round(), 0);
    wait_until("recognizer reset", || h.asr.reset_count() >= 1).await;
    h.shutdown().await;
}

#[tokio::test]
async fn test_realtime_barge_in_drains_previous_reply() {
    let h = Harness::start(
        config(ListenMode::Realtime),
        vec![
            Script::text("One. Two. Three. Four. Five. Six."),
            Script::text("Sure, something else."),
        ],
    );
    h.tts.set_delay(Duration::from_millis(80));

    assert!(h.asr.emit("tell me a story").await);
    wait_until("first sentence", || !h.conn.spoken_sentences().is_empty()).await;

    let resets_before = h.asr.reset_count();
    assert!(h.asr.emit("stop, something else").await);
    assert!(h.asr.reset_count() > resets_before);
    h.wait_for_stops(1).await;

    let messages = h.conn.messages();
    let second_stt = messages
        .iter()
        .position(|m| m["type"] == "stt" && m["text"] == "stop, something else")
        .unwrap();
    for message in &messages[second_stt..] {
        if message["state"] == "sentence_start" {
            assert_eq!(message["text"], "Sure, something else.");
        }
    }
    assert!(!h.tts.spoken().contains(&"Six.".to_string()));
    assert_eq!(h.session.talk_round(), 2);
    h.shutdown().await;
}

#[tokio::test]
async fn test_abort_drops_queued_audio_and_next_round_proceeds() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![
            Script::text("One. Two. Three. Four. Five. Six."),
            Script::text("Hello again."),
        ],
    );
    h.tts.set_delay(Duration::from_millis(80));

    h.asr.emit("count to six").await;
    wait_until("first sentence", || !h.conn.spoken_sentences().is_empty()).await;
    h.conn.push_json(json!({"type": "abort", "reason": "wake_word_detected"}));
    h.wait_for_stops(1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let delivered = h.conn.spoken_sentences();
    assert!(delivered.len() < 6, "abort did not stop delivery: {delivered:?}");
    assert!(!delivered.contains(&"Six.".to_string()));
    assert_eq!(h.tts.file_count(), 0);

    h.tts.set_delay(Duration::ZERO);
    h.asr.emit("hi").await;
    h.wait_for_stops(2).await;
    assert_eq!(h.conn.spoken_sentences().last().unwrap(), "Hello again.");
    h.shutdown().await;
}

#[tokio::test]
async fn test_abort_rearms_recognizer() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::text("One. Two. Three. Four. Five. Six.")],
    );
    h.tts.set_delay(Duration::from_millis(80));

    assert!(h.asr.emit("count to six").await);
    wait_until("first sentence", || !h.conn.spoken_sentences().is_empty()).await;
    let resets_before = h.asr.reset_count();
    h.conn.push_json(json!({"type": "abort"}));
    h.wait_for_stops(1).await;

    wait_until("recognizer reset", || h.asr.reset_count() > resets_before).await;
    assert!(!h.session.is_closed());
    h.shutdown().await;
}

#[tokio::test]
async fn test_segment_indices_increase_within_round() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::text("One. Two. Three. Four.")],
    );
    h.tts.fail_on("Three.");
    h.asr.emit("count to four").await;
    h.wait_for_stops(1).await;

    let indices: Vec<u64> = h
        .conn
        .messages_of("tts")
        .iter()
        .filter(|m| m["state"] == "sentence_start")
        .map(|m| m["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices.len(), 3, "unexpected indices: {indices:?}");
    assert!(
        indices.windows(2).all(|pair| pair[0] < pair[1]),
        "indices not increasing: {indices:?}"
    );
    assert_eq!(h.conn.spoken_sentences(), vec!["One.", "Two.", "Four."]);
    assert_eq!(h.conn.tts_states().last().map(String::as_str), Some("stop"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_dialogue_is_trimmed_after_each_round() {
    let h = Harness::start(
        SessionConfig {
            max_history_turns: 1,
            ..config(ListenMode::Auto)
        },
        vec![
            Script::text("First answer."),
            Script::text("Second answer."),
            Script::text("Third answer."),
        ],
    );
    for (n, question) in ["first question", "second question", "third question"]
        .into_iter()
        .enumerate()
    {
        h.asr.emit(question).await;
        h.wait_for_stops(n + 1).await;
    }

    let history = h.session.history().await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, Role::System);
    assert_eq!(history[1].content, "third question");
    assert_eq!(history[2].content, "Third answer.");
    h.shutdown().await;
}

#[tokio::test]
async fn test_close_runs_once() {
    let h = Harness::start(config(ListenMode::Auto), vec![]);
    h.tts.set_voice("nova").unwrap();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let session = h.session.clone();
            tokio::spawn(async move { session.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert!(h.session.is_closed());
    assert!(h.session.stop_signal().is_cancelled());
    assert_eq!(h.conn.close_count(), 1);
    assert_eq!(h.asr.reset_count(), 1);
    assert_eq!(h.tts.voice(), "alloy");

    tokio::time::timeout(Duration::from_secs(3), h.task)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_tool_call_round_trip() {
    let mut tools = MockToolExecutor::new();
    tools.expect_definitions().returning(|| {
        vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }]
    });
    tools.expect_is_registered_tool().returning(|name| name == "get_weather");
    tools
        .expect_execute_tool()
        .with(eq("get_weather"), eq(r#"{"city":"Paris"}"#))
        .times(1)
        .returning(|_, _| Ok(ToolAction::RequestLlm("sunny, 21 degrees".into())));

    let h = Harness::start_with_tools(
        config(ListenMode::Auto),
        vec![
            Script::tool_call("call_1", "get_weather", r#"{"city":"Paris"}"#),
            Script::text("It is sunny in Paris."),
        ],
        Arc::new(tools),
    );

    h.asr.emit("what's the weather in Paris?").await;
    h.wait_for_stops(1).await;

    let calls = h.llm.calls();
    assert_eq!(calls.len(), 2);
    let second = &calls[1];
    let tool_turn = second.last().unwrap();
    assert_eq!(tool_turn.role, Role::Tool);
    assert_eq!(tool_turn.content, "sunny, 21 degrees");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call_1"));
    let call_turn = &second[second.len() - 2];
    assert_eq!(call_turn.role, Role::Assistant);
    assert_eq!(call_turn.tool_calls[0].name, "get_weather");

    // Nothing was synthesized for the first response.
    assert_eq!(h.tts.spoken(), vec!["It is sunny in Paris."]);
    assert_eq!(h.session.talk_round(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_direct_tool_response_is_spoken() {
    let mut tools = MockToolExecutor::new();
    tools.expect_definitions().returning(Vec::new);
    tools
        .expect_execute_tool()
        .returning(|_, _| Ok(ToolAction::Respond("Done. The lights are off.".into())));

    let h = Harness::start_with_tools(
        config(ListenMode::Auto),
        vec![Script::tool_call("call_9", "lights_off", "{}")],
        Arc::new(tools),
    );
    h.asr.emit("lights off").await;
    h.wait_for_stops(1).await;

    assert_eq!(h.llm.calls().len(), 1);
    assert_eq!(h.conn.spoken_sentences(), vec!["Done", "The lights are off"]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_tool_depth_is_bounded() {
    let mut tools = MockToolExecutor::new();
    tools.expect_definitions().returning(Vec::new);
    tools
        .expect_execute_tool()
        .returning(|_, _| Ok(ToolAction::RequestLlm("again".into())));

    let scripts = (0..5)
        .map(|i| Script::tool_call(&format!("call_{i}"), "loop", "{}"))
        .collect();
    let h = Harness::start_with_tools(
        SessionConfig {
            max_tool_rounds: 2,
            ..config(ListenMode::Auto)
        },
        scripts,
        Arc::new(tools),
    );
    h.asr.emit("loop forever").await;
    h.wait_for_stops(1).await;

    assert_eq!(h.llm.calls().len(), 3);
    assert_eq!(h.conn.spoken_sentences(), vec![APOLOGY]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_llm_failure_speaks_apology() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::Fail("upstream timeout".into())],
    );
    h.asr.emit("hello there").await;
    h.wait_for_stops(1).await;

    assert_eq!(h.conn.spoken_sentences(), vec![APOLOGY]);
    assert!(!h.session.is_closed());
    h.shutdown().await;
}

#[tokio::test]
async fn test_service_failure_marker_speaks_apology() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::Chunks(vec![LlmChunk::Content(
            "【服务响应异常: quota exceeded】".into(),
        )])],
    );
    h.asr.emit("hello there").await;
    h.wait_for_stops(1).await;
    assert_eq!(h.conn.spoken_sentences(), vec![APOLOGY]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_failed_segment_is_skipped() {
    let h = Harness::start(
        config(ListenMode::Auto),
        vec![Script::text("First part. Second part. Third part.")],
    );
    h.tts.fail_on("Second part.");
    h.asr.emit("go").await;
    h.wait_for_stops(1).await;

    assert_eq!(h.conn.spoken_sentences(), vec!["First part.", "Third part."]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_silence_timeout_closes_after_reply() {
    let h = Harness::start(config(ListenMode::Auto), vec![Script::text("Goodbye!")]);
    h.asr.set_silence_count(2);
    assert!(h.asr.emit("").await);

    tokio::time::timeout(Duration::from_secs(3), h.task)
        .await
        .expect("session did not close")
        .unwrap()
        .unwrap();
    assert!(h.session.is_closed());
    assert_eq!(h.conn.stt_texts(), vec![SILENCE_PROMPT]);
    assert_eq!(h.conn.spoken_sentences(), vec!["Goodbye!"]);
    assert_eq!(h.conn.close_count(), 1);
}

#[tokio::test]
async fn test_exit_command_closes_without_reply() {
    let h = Harness::start(config(ListenMode::Auto), vec![]);
    h.conn.push_json(json!({"type": "chat", "text": "Goodbye!"}));

    tokio::time::timeout(Duration::from_secs(3), h.task)
        .await
        .expect("session did not close")
        .unwrap()
        .unwrap();
    assert!(h.llm.calls().is_empty());
    assert!(h.conn.stt_texts().is_empty());
}

#[tokio::test]
async fn test_empty_chat_is_rejected() {
    let h = Harness::start(config(ListenMode::Auto), vec![]);
    let result = h.session.handle_chat("  ").await;
    assert!(matches!(result, Err(SessionError::EmptyInput(_))));
    assert_eq!(h.conn.tts_states(), vec!["stop"]);
    assert_eq!(h.session.talk_round(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn test_quick_reply_on_first_round() {
    let h = Harness::start(
        SessionConfig {
            quick_reply: true,
            quick_reply_words: vec!["I'm here!".into()],
            ..config(ListenMode::Auto)
        },
        vec![Script::text("Second answer.")],
    );
    h.asr.emit("hello assistant").await;
    h.wait_for_stops(1).await;
    assert!(h.llm.calls().is_empty());
    assert_eq!(h.conn.spoken_sentences(), vec!["I'm here!"]);

    // Only the first round is answered from the quick reply list.
    h.asr.emit("hello assistant").await;
    h.wait_for_stops(2).await;
    assert_eq!(h.llm.calls().len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_hello_configures_decoder_and_replies() {
    let h = Harness::start(config(ListenMode::Auto), vec![]);
    h.conn.push_json(json!({
        "type": "hello",
        "version": 1,
        "audio_params": {"format": "pcm", "sample_rate": 16000, "channels": 2, "frame_duration": 60}
    }));
    wait_until("hello reply", || !h.conn.messages_of("hello").is_empty()).await;
    let hello = &h.conn.messages_of("hello")[0];
    assert_eq!(hello["session_id"], "test-session");
    assert_eq!(hello["transport"], "websocket");

    // Stereo frames are down-mixed before reaching the recognizer.
    h.conn.push_audio(&[0u8; 8]);
    wait_until("audio forwarded", || h.asr.audio_bytes() == 4).await;
    h.shutdown().await;
}

#[tokio::test]
async fn test_write_failure_ends_session() {
    let h = Harness::start(config(ListenMode::Auto), vec![Script::text("Hi there.")]);
    h.conn.fail_writes();
    h.asr.emit("hello").await;

    tokio::time::timeout(Duration::from_secs(3), h.task)
        .await
        .expect("session did not close")
        .unwrap()
        .unwrap();
    assert!(h.session.is_closed());
    assert!(h.llm.calls().is_empty());
    assert_eq!(h.conn.close_count(), 1);
}

#[tokio::test]
async fn test_orphan_tool_turns_are_not_sent() {
    let h = Harness::start(
        SessionConfig {
            max_history_turns: 2,
            ..config(ListenMode::Auto)
        },
        vec![Script::text("Fine.")],
    );
    {
        let mut dialogue = h.session.dialogue.lock().await;
        dialogue.append(Message::user("earlier"));
        dialogue.append(Message::assistant_tool_call(ToolCall {
            id: "call_0".into(),
            name: "get_current_time".into(),
            arguments: "{}".into(),
        }));
        dialogue.append(Message::tool("call_0", "12:00"));
    }
    h.asr.emit("how are you").await;
    h.wait_for_stops(1).await;

    let sent = &h.llm.calls()[0];
    assert_eq!(sent[0].role, Role::System);
    assert!(sent[1..].iter().all(|m| m.role != Role::Tool));
    assert_eq!(sent.last().unwrap().content, "how are you");
    h.shutdown().await;
}
