use crate::errors::ProviderError;
use crate::model::ProviderId;
use crate::provider::ChatChunk;
use crate::stream::TokenUsage;

/// One dispatched server-sent event; only `data:` fields matter for chat streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseMessage {
    pub data: String,
}

/// Line-oriented SSE reader. Bytes may arrive split anywhere, including
/// inside a UTF-8 sequence or between `\r` and `\n`.
#[derive(Default)]
pub(crate) struct SseReader {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseReader {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            out.extend(self.take_line(&line[..newline]));
        }
        out
    }

    /// Dispatches whatever is buffered when the body ends without a blank line.
    pub fn flush(&mut self) -> Option<SseMessage> {
        let tail = std::mem::take(&mut self.pending);
        let from_tail = self.take_line(&tail);
        from_tail.or_else(|| self.dispatch())
    }

    fn take_line(&mut self, raw: &[u8]) -> Option<SseMessage> {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.strip_suffix('\r').unwrap_or(&decoded);
        if line.is_empty() {
            return self.dispatch();
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        // Comment lines have an empty field name.
        if field == "data" {
            self.data.push(value.trim_start().to_owned());
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseMessage { data })
    }
}

/// What one SSE message of a chat-completions stream means.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FrameOutcome {
    Chunk(ChatChunk),
    Skip,
    /// `data: [DONE]`
    End,
}

pub(crate) fn map_chat_message(
    provider: &ProviderId,
    message: &SseMessage,
) -> Result<FrameOutcome, ProviderError> {
    let data = message.data.trim();
    if data.is_empty() {
        return Ok(FrameOutcome::Skip);
    }
    if data == "[DONE]" {
        return Ok(FrameOutcome::End);
    }
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        ProviderError::protocol(provider.clone(), format!("invalid SSE JSON frame: {e}"))
    })?;
    map_chat_json(provider, &value).map(FrameOutcome::Chunk)
}

/// An `{"error": {...}}` body, in either a stream frame or a full reply.
fn error_object(provider: &ProviderId, value: &serde_json::Value) -> Option<ProviderError> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| error.to_string());
    let status = error
        .get("code")
        .and_then(|v| v.as_u64())
        .and_then(|c| u16::try_from(c).ok());
    Some(ProviderError::provider(provider.clone(), message, status))
}

/// Text of the first choice of a non-streaming reply; missing content is empty.
pub(crate) fn map_completion_json(
    provider: &ProviderId,
    value: &serde_json::Value,
) -> Result<String, ProviderError> {
    if let Some(err) = error_object(provider, value) {
        return Err(err);
    }
    let choices = value
        .get("choices")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProviderError::protocol(provider.clone(), "completion reply has no choices"))?;
    Ok(choices
        .first()
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .unwrap_or_default()
        .to_owned())
}

pub(crate) fn map_chat_json(
    provider: &ProviderId,
    value: &serde_json::Value,
) -> Result<ChatChunk, ProviderError> {
    if let Some(err) = error_object(provider, value) {
        return Err(err);
    }

    let str_field = |v: &serde_json::Value, key: &str| {
        v.get(key).and_then(|f| f.as_str()).map(ToOwned::to_owned)
    };

    let mut chunk = ChatChunk {
        id: str_field(value, "id"),
        model: str_field(value, "model"),
        ..ChatChunk::default()
    };

    if let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
    {
        chunk.finish_reason = str_field(choice, "finish_reason");
        if let Some(delta) = choice.get("delta") {
            chunk.role = str_field(delta, "role");
            chunk.delta = str_field(delta, "content").filter(|s| !s.is_empty());
            chunk.audio_url = delta.get("audio").and_then(|a| str_field(a, "url"));
        }
    }

    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        let count = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        chunk.usage = Some(TokenUsage {
            input_tokens: count("prompt_tokens"),
            output_tokens: count("completion_tokens"),
        });
    }

    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderId {
        ProviderId::new("openai-compat")
    }

    #[test]
    fn reader_joins_messages_split_across_reads() {
        let mut reader = SseReader::default();
        assert!(reader.feed(b": keep-alive\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"hel").is_empty());
        let messages = reader.feed(b"lo\"}}]}\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(messages.len(), 2);
        match map_chat_message(&provider(), &messages[0]).expect("chunk") {
            FrameOutcome::Chunk(chunk) => assert_eq!(chunk.delta.as_deref(), Some("hello")),
            other => panic!("unexpected frame outcome: {other:?}"),
        }
        assert_eq!(
            map_chat_message(&provider(), &messages[1]).expect("done"),
            FrameOutcome::End
        );
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut reader = SseReader::default();
        let messages = reader.feed(b"event: note\ndata: a\ndata: b\n\n");
        assert_eq!(messages, vec![SseMessage { data: "a\nb".into() }]);
    }

    #[test]
    fn maps_usage_and_finish_reason() {
        let value = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "qwen-plus",
            "choices": [{"delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        let chunk = map_chat_json(&provider(), &value).expect("chunk");
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        assert_eq!(
            chunk.usage,
            Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 2
            })
        );
        assert_eq!(chunk.delta, None);
    }

    #[test]
    fn completion_reply_takes_first_choice_text() {
        let value = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": " a cat\n a dog"}}]
        });
        assert_eq!(
            map_completion_json(&provider(), &value).expect("reply"),
            " a cat\n a dog"
        );
        let empty = serde_json::json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(map_completion_json(&provider(), &empty).expect("reply"), "");
        let err = map_completion_json(&provider(), &serde_json::json!({"error": {"message": "bad key"}}))
            .expect_err("error reply");
        assert_eq!(err.message(), "bad key");
        assert!(matches!(
            map_completion_json(&provider(), &serde_json::json!({"id": "x"})),
            Err(ProviderError::Protocol { .. })
        ));
    }

    #[test]
    fn usage_only_chunk_with_empty_choices() {
        let value = serde_json::json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 9}});
        let chunk = map_chat_json(&provider(), &value).expect("chunk");
        assert_eq!(chunk.usage.map(|u| u.output_tokens), Some(9));
    }

    #[test]
    fn error_object_becomes_provider_error() {
        let value = serde_json::json!({"error": {"message": "Arrearage", "code": 400}});
        let err = map_chat_json(&provider(), &value).expect_err("error frame");
        assert_eq!(err.message(), "Arrearage");
        assert_eq!(err.status_code(), Some(400));
    }

    #[test]
    fn invalid_json_is_protocol_error() {
        let message = SseMessage {
            data: "{not json".into(),
        };
        assert!(matches!(
            map_chat_message(&provider(), &message),
            Err(ProviderError::Protocol { .. })
        ));
    }

    #[test]
    fn flush_dispatches_unterminated_message() {
        let mut reader = SseReader::default();
        assert!(reader.feed(b"data: [DONE]").is_empty());
        let message = reader.flush().expect("trailing message");
        assert_eq!(message.data, "[DONE]");
        assert!(reader.flush().is_none());
    }
}
