//! Retry/backoff, rate-limit, and SSE streaming scenarios exercised against
//! a real HTTP server (`wiremock`) rather than mocked transport internals.

use std::time::{Duration, Instant};

use llmproxy::error::LlmError;
use llmproxy::model::{CompletionRequest, Message, Role};
use llmproxy::providers::http_core::HttpCoreConfig;
use llmproxy::providers::openai::{OpenAiConfig, OpenAiProvider};
use llmproxy::providers::LlmProvider;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "gpt-4".into(),
        messages: vec![Message {
            role: Role::User,
            content: "hi".into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }],
        temperature: None,
        top_p: None,
        max_tokens: None,
        stop: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
        tools: None,
        tool_choice: None,
        stream: false,
        metadata: Default::default(),
    }
}

fn provider(base_url: String, max_retries: u32) -> OpenAiProvider {
    OpenAiProvider::new(OpenAiConfig {
        name: "openai-test".into(),
        base_url,
        api_key: "sk-test".into(),
        http: HttpCoreConfig {
            max_retries,
            request_timeout: Duration::from_secs(5),
            ..HttpCoreConfig::default()
        },
    })
    .expect("provider builds")
}

#[tokio::test]
async fn retries_twice_on_server_error_then_succeeds() {
    let server = MockServer::start().await;

    let success_body = serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{"message": {"content": "recovered"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1},
    });

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&success_body))
        .expect(1)
        .mount(&server)
        .await;

    let p = provider(server.uri(), 3);

    let started = Instant::now();
    let resp = p.send_completion(&request()).await.expect("eventually succeeds");
    let elapsed = started.elapsed();

    assert_eq!(resp.content, "recovered");
    // Backoff is 1s then 2s between the three attempts; allow generous slack
    // since this runs on a shared CI box.
    assert!(elapsed >= Duration::from_millis(2_400), "elapsed {elapsed:?} too short for two backoffs");
}

#[tokio::test]
async fn rate_limit_response_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
        .expect(1)
        .mount(&server)
        .await;

    let p = provider(server.uri(), 3);
    let err = p.send_completion(&request()).await.expect_err("rate limit should surface as error");

    match err {
        LlmError::RateLimit { retry_after } => {
            assert_eq!(retry_after, Some(Duration::from_secs(60)));
        }
        other => panic!("expected RateLimit, got {other:?}"),
    }
}

#[tokio::test]
async fn streamed_deltas_concatenate_to_full_content() {
    let server = MockServer::start().await;

    let body = concat!(
        "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let p = provider(server.uri(), 0);
    let mut rx = p.stream_completion(&request()).await.expect("stream starts");

    let mut concatenated = String::new();
    let mut saw_stop = false;
    while let Some(chunk) = rx.recv().await {
        assert!(chunk.error.is_none(), "unexpected error chunk: {:?}", chunk.error);
        concatenated.push_str(&chunk.delta);
        if chunk.finish_reason.is_some() {
            saw_stop = true;
        }
    }

    assert_eq!(concatenated, "HelloHelloHello");
    assert!(saw_stop, "expected a terminal chunk carrying finish_reason");
}
