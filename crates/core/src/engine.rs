use crate::config::RetrievalConfig;
use crate::error::{ChatError, GenerationError, SearchError};
use crate::llm::ChatModel;
use crate::memory::MemoryStore;
use crate::models::{Answer, SearchHit, Turn};
use crate::retriever::{Retriever, SearchStrategy};
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

const INSTRUCTION: &str = "Use the following pieces of context from the report to answer the \
question at the end. If you don't know the answer, say that you don't know; do not make one up.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub top_k: usize,
    pub strategy: SearchStrategy,
}

impl From<&RetrievalConfig> for EngineOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            strategy: config.search_strategy(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Terminated,
}

/// One chat session: retrieval, one model call and memory per question.
pub struct ConversationalEngine<R, L, M>
where
    R: Retriever,
    L: ChatModel,
    M: MemoryStore,
{
    retriever: R,
    llm: L,
    memory: M,
    options: EngineOptions,
    session_id: Uuid,
    state: SessionState,
    span: Span,
}

impl<R, L, M> ConversationalEngine<R, L, M>
where
    R: Retriever,
    L: ChatModel,
    M: MemoryStore,
{
    pub fn new(retriever: R, llm: L, memory: M, options: EngineOptions) -> Self {
        Self {
            retriever,
            llm,
            memory,
            options,
            session_id: Uuid::new_v4(),
            state: SessionState::Ready,
            span: Span::current(),
        }
    }

    /// Parents this session's spans under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[Turn] {
        self.memory.history()
    }

    pub async fn answer(&mut self, question: &str) -> Result<Answer, ChatError> {
        let span = info_span!(parent: &self.span, "answer", session = %self.session_id);
        self.answer_in_session(question).instrument(span).await
    }

    /// Ends the session and discards its memory.
    pub fn terminate(&mut self) {
        self.memory.clear();
        self.state = SessionState::Terminated;
    }

    async fn answer_in_session(&mut self, question: &str) -> Result<Answer, ChatError> {
        if self.state == SessionState::Terminated {
            return Err(ChatError::SessionTerminated(self.session_id));
        }

        let question = question.trim();
        if question.is_empty() {
            return Err(SearchError::InvalidArgument("question is empty".to_string()).into());
        }

        let sources = self
            .retriever
            .retrieve(question, self.options.top_k, self.options.strategy)
            .await?;

        let prompt = build_prompt(self.memory.history(), &sources, question);
        let text = match self.llm.generate(&prompt).await.and_then(|raw| parse_answer(&raw)) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, model = self.llm.model_name(), "generation failed");
                return Err(error.into());
            }
        };

        self.memory.append(Turn::new(question, text.clone()));
        info!(
            sources = sources.len(),
            turns = self.memory.history().len(),
            "answered question"
        );

        Ok(Answer { text, sources })
    }
}

pub fn build_prompt(history: &[Turn], sources: &[SearchHit], question: &str) -> String {
    let mut prompt = String::from(INSTRUCTION);

    if !history.is_empty() {
        prompt.push_str("\n\nConversation so far:");
        for turn in history {
            prompt.push_str("\nHuman: ");
            prompt.push_str(&turn.question);
            prompt.push_str("\nAssistant: ");
            prompt.push_str(&turn.answer);
        }
    }

    prompt.push_str("\n\nContext:\n");
    if sources.is_empty() {
        prompt.push_str("(no matching passages)");
    } else {
        let context = sources
            .iter()
            .map(|hit| hit.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        prompt.push_str(&context);
    }

    prompt.push_str("\n\nQuestion: ");
    prompt.push_str(question);
    prompt.push_str("\nAnswer:");
    prompt
}

pub fn parse_answer(raw: &str) -> Result<String, GenerationError> {
    let trimmed = raw.trim();
    let text = trimmed
        .strip_prefix("Answer:")
        .map(str::trim)
        .unwrap_or(trimmed);

    if text.is_empty() {
        return Err(GenerationError::Unparseable(
            "model returned an empty answer".to_string(),
        ));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::Embedder;
    use crate::index::EmbeddingIndex;
    use crate::memory::BufferMemory;
    use crate::retriever::IndexRetriever;
    use crate::testing::{chunk, FixedEmbedder, ScriptedChatModel};
    use std::sync::Arc;

    async fn retriever() -> Arc<IndexRetriever> {
        let mut embedder = FixedEmbedder::new(2);
        embedder.insert("Cancer screening improves outcomes.", vec![1.0, 0.0]);
        embedder.insert("Tobacco use raises risk.", vec![0.0, 1.0]);
        let embedder: Arc<dyn Embedder> = Arc::new(embedder);
        let chunks = vec![
            chunk(0, "Cancer screening improves outcomes."),
            chunk(1, "Tobacco use raises risk."),
        ];
        let index = EmbeddingIndex::build(chunks, &embedder, 8).await.unwrap();
        Arc::new(IndexRetriever::with_index(embedder, index).unwrap())
    }

    fn options() -> EngineOptions {
        EngineOptions {
            top_k: 1,
            strategy: SearchStrategy::Similarity,
        }
    }

    #[tokio::test]
    async fn memory_grows_per_answer_and_survives_failures() {
        let llm = Arc::new(ScriptedChatModel::new(vec![
            Ok("one"),
            Ok("Answer: two"),
            Ok("three"),
            Err("rate limited"),
        ]));
        let mut engine =
            ConversationalEngine::new(retriever().await, llm.clone(), BufferMemory::default(), options());

        for question in ["first?", "second?", "third?"] {
            engine.answer(question).await.unwrap();
        }
        assert_eq!(engine.history().len(), 3);
        assert_eq!(engine.history()[1], Turn::new("second?", "two"));

        let failed = engine.answer("fourth?").await;
        assert!(matches!(failed, Err(ChatError::Generation(_))));
        assert_eq!(engine.history().len(), 3);
        assert_eq!(engine.state(), SessionState::Ready);

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[3].contains("Human: third?\nAssistant: three"));
    }

    #[tokio::test]
    async fn empty_model_reply_is_a_generation_error() {
        let llm = ScriptedChatModel::new(vec![Ok("   ")]);
        let mut engine =
            ConversationalEngine::new(retriever().await, llm, BufferMemory::default(), options());

        let result = engine.answer("What improves outcomes?").await;
        assert!(matches!(
            result,
            Err(ChatError::Generation(GenerationError::Unparseable(_)))
        ));
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn answer_returns_sources_used_in_prompt() {
        let llm = Arc::new(ScriptedChatModel::new(vec![Ok("Screening.")]));
        let mut engine =
            ConversationalEngine::new(retriever().await, llm.clone(), BufferMemory::default(), options());

        let answer = engine.answer("Cancer screening improves outcomes.").await.unwrap();
        assert_eq!(answer.text, "Screening.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].chunk.chunk_index, 0);

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("Cancer screening improves outcomes."));
        assert!(!prompt.contains("Tobacco use raises risk."));
        assert!(prompt.ends_with("Question: Cancer screening improves outcomes.\nAnswer:"));
    }

    #[tokio::test]
    async fn retrieval_failure_leaves_memory_untouched() {
        let llm = ScriptedChatModel::new(vec![Ok("unused")]);
        let unloaded = IndexRetriever::new(Arc::new(FixedEmbedder::new(2)));
        let mut engine =
            ConversationalEngine::new(unloaded, llm, BufferMemory::default(), options());

        let result = engine.answer("anything?").await;
        assert!(matches!(result, Err(ChatError::Search(SearchError::NotLoaded))));
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn terminated_session_refuses_questions() {
        let llm = ScriptedChatModel::new(vec![Ok("one"), Ok("two")]);
        let mut engine =
            ConversationalEngine::new(retriever().await, llm, BufferMemory::default(), options());
        engine.answer("first?").await.unwrap();

        engine.terminate();
        assert_eq!(engine.state(), SessionState::Terminated);
        assert!(engine.history().is_empty());
        assert!(matches!(
            engine.answer("second?").await,
            Err(ChatError::SessionTerminated(_))
        ));
    }

    #[test]
    fn prompt_without_history_or_sources_still_has_question() {
        let prompt = build_prompt(&[], &[], "What is the plan?");
        assert!(!prompt.contains("Conversation so far"));
        assert!(prompt.contains("(no matching passages)"));
        assert!(prompt.ends_with("Question: What is the plan?\nAnswer:"));
    }

    #[test]
    fn answer_label_is_stripped() {
        assert_eq!(parse_answer("  Answer:  Early detection.\n").unwrap(), "Early detection.");
        assert_eq!(parse_answer("Plain text").unwrap(), "Plain text");
    }
}
