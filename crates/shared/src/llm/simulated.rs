use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::sleep;

use super::prompts::truncate_chars;
use super::provider::{
    CompletionProvider, CompletionRequest, FragmentStream, ProviderFuture,
};

const WORDS_PER_FRAGMENT: usize = 3;
const DOCUMENT_PREVIEW_CHARS: usize = 100;
const DEFAULT_FRAGMENT_DELAY_MS: u64 = 100;

/// Offline provider that streams a canned answer built from the query and
/// the first characters of the document. Every key is accepted.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    fragment_delay: Duration,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_FRAGMENT_DELAY_MS))
    }
}

impl SimulatedProvider {
    pub fn new(fragment_delay: Duration) -> Self {
        Self { fragment_delay }
    }
}

pub fn simulated_answer(query: &str, document: Option<&str>) -> String {
    let mut answer = match document.filter(|content| !content.is_empty()) {
        Some(content) => format!(
            "Based on the document you provided, I can see that it contains information about: {}... ",
            truncate_chars(content, DOCUMENT_PREVIEW_CHARS)
        ),
        None => "I'd be happy to help you with your query. ".to_string(),
    };
    answer.push_str(&format!(
        "Regarding your question '{query}', this is a simulated response for testing purposes. "
    ));
    answer.push_str(
        "With a live provider credential the answer would be a detailed analysis of your document.",
    );
    answer
}

/// Groups of three whitespace-separated words, each followed by a space.
pub fn split_fragments(text: &str) -> VecDeque<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(WORDS_PER_FRAGMENT)
        .map(|group| format!("{} ", group.join(" ")))
        .collect()
}

impl CompletionProvider for SimulatedProvider {
    fn validate_key<'a>(&'a self, _api_key: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }

    fn open_stream<'a>(
        &'a self,
        _api_key: &'a str,
        request: CompletionRequest,
    ) -> ProviderFuture<'a, FragmentStream> {
        let fragments = split_fragments(&simulated_answer(
            &request.query,
            request.document.as_deref(),
        ));
        let delay = self.fragment_delay;

        Box::pin(async move {
            let stream: FragmentStream = Box::pin(futures_util::stream::unfold(
                (fragments, true),
                move |(mut fragments, first)| async move {
                    let fragment = fragments.pop_front()?;
                    if !first && !delay.is_zero() {
                        sleep(delay).await;
                    }
                    Some((Ok(fragment), (fragments, false)))
                },
            ));
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    fn request(query: &str, document: Option<&str>) -> CompletionRequest {
        CompletionRequest {
            messages: Vec::new(),
            max_tokens: 100,
            temperature: 0.7,
            query: query.to_string(),
            document: document.map(ToString::to_string),
        }
    }

    #[test]
    fn answer_mentions_document_prefix_and_query() {
        let answer = simulated_answer("What color is the sky?", Some("The sky is blue."));

        assert!(answer.starts_with(
            "Based on the document you provided, I can see that it contains information about: The sky is blue...."
        ));
        assert!(answer.contains("'What color is the sky?'"));
    }

    #[test]
    fn answer_without_document_uses_generic_opening() {
        let answer = simulated_answer("hello", None);
        assert!(answer.starts_with("I'd be happy to help you with your query. "));
    }

    #[test]
    fn fragments_are_three_word_groups() {
        let fragments = split_fragments("one two three four five");
        assert_eq!(
            fragments,
            VecDeque::from(vec!["one two three ".to_string(), "four five ".to_string()])
        );
    }

    #[tokio::test]
    async fn stream_concatenation_matches_answer_words() {
        let provider = SimulatedProvider::new(Duration::ZERO);
        let stream = provider
            .open_stream("any-key", request("What color is the sky?", Some("The sky is blue.")))
            .await
            .expect("stream should open");

        let fragments: Vec<String> = stream
            .map(|item| item.expect("fragment should be ok"))
            .collect()
            .await;
        let joined = fragments.concat();
        let expected = simulated_answer("What color is the sky?", Some("The sky is blue."));

        assert!(fragments.len() > 1);
        assert_eq!(
            joined.split_whitespace().collect::<Vec<_>>(),
            expected.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn every_key_is_valid() {
        let provider = SimulatedProvider::default();
        assert!(provider.validate_key("anything").await.expect("probe"));
    }
}
