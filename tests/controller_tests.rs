use adchat::api::mock_client::{chunk_record, done_record, MockBackend, ScriptedStream};
use adchat::state::{self, ControlError, ControllerHandle, Phase, SessionOptions, SessionView};
use adchat::types::{Attachment, Turn};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

async fn settle(
    handle: &ControllerHandle,
    predicate: impl FnMut(&SessionView) -> bool,
) -> Result<SessionView> {
    let view = tokio::time::timeout(Duration::from_secs(5), handle.wait_until(predicate)).await??;
    Ok(view)
}

#[tokio::test]
async fn test_streamed_reply_is_reconciled_and_decorated() -> Result<()> {
    let mock = MockBackend::new();
    let (tx, stream) = ScriptedStream::manual();
    let server_turns = vec![Turn::user("u-1", "hi"), Turn::assistant("srv-1", "Hello")];
    mock.push_stream(stream)
        .push_transcript(server_turns.clone())
        .push_attachment(Some(Attachment {
            advertiser: "Vercel".to_string(),
            headline: "Deploy Instantly".to_string(),
            description: "Build and deploy in seconds.".to_string(),
            cta_text: "Start Building".to_string(),
            url: "https://vercel.com".to_string(),
            image_url: None,
        }));

    let handle = state::spawn(Arc::new(mock.clone()), "c1", SessionOptions::default());
    handle.send("hi").await?;

    let view = handle.view();
    assert_eq!(view.phase, Phase::Sending);
    assert_eq!(view.transcript.len(), 1);
    assert!(state::is_local_turn_id(&view.transcript[0].id));

    tx.send(chunk_record("He"))?;
    settle(&handle, |v| v.streaming_content == "He").await?;
    tx.send(chunk_record("llo"))?;
    settle(&handle, |v| v.streaming_content == "Hello").await?;

    tx.send(done_record("srv-1"))?;
    let view = settle(&handle, |v| {
        v.phase == Phase::Idle && v.attachment_for("srv-1").is_some()
    })
    .await?;

    assert_eq!(view.transcript.turns(), server_turns.as_slice());
    assert_eq!(mock.attachment_requests(), vec![("c1".to_string(), 0)]);
    assert!(view.error.is_none());

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_second_send_during_stream_is_rejected() -> Result<()> {
    let mock = MockBackend::new();
    mock.push_stream(ScriptedStream::Hanging(vec![chunk_record("working")]));

    let handle = state::spawn(Arc::new(mock.clone()), "c1", SessionOptions::default());
    handle.send("first").await?;
    settle(&handle, |v| v.phase == Phase::Streaming).await?;

    assert!(matches!(handle.send("second").await, Err(ControlError::Busy)));
    assert_eq!(handle.view().transcript.len(), 1);

    assert!(handle.cancel().await?);
    let view = handle.view();
    assert_eq!(view.phase, Phase::Idle);
    assert_eq!(view.transcript.len(), 1);
    assert!(view.error.is_none());

    handle.shutdown().await;
    Ok(())
}
