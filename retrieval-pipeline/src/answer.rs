use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::{error::RetrievalError, utils::config::AppConfig};
use tracing::debug;

use crate::context::ContextSourceEntry;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Ты — ассистент по технической документации. \
Отвечай только на основе приведённого контекста. Если контекст не содержит ответа, \
скажи об этом прямо. Указывай источники в квадратных скобках.";

/// Language-model collaborator that turns the assembled context into an
/// answer. The user message always embeds the context and the literal query.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, RetrievalError>;
}

pub fn create_user_message(context: &str, query: &str) -> String {
    format!(
        r"Контекст:
==================
{context}
==================

Вопрос пользователя: {query}"
    )
}

pub struct OpenAiAnswerGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnswerGenerator {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Generator wired from application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(config.openai_api_key.clone())
                .with_api_base(config.openai_base_url.clone()),
        );
        Self::new(client, config.query_model.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiAnswerGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, RetrievalError> {
        debug!(model = %self.model, "Requesting chat completion for assembled context");
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt.to_owned()).into(),
                ChatCompletionRequestUserMessage::from(user_message.to_owned()).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(RetrievalError::LLMParsing(
                "No content found in LLM response".into(),
            ))
    }
}

/// Render a direct answer from source text and tables, bypassing the model.
/// Used for narrow catalog lookups where the spec-sheet rows are the answer.
pub fn build_raw_answer(sources: &[ContextSourceEntry]) -> String {
    let mut answer = String::new();

    for source in sources {
        if let Some(section) = source.section_path.as_deref() {
            answer.push_str(&format!("{} — раздел {section}\n", source.filename));
        } else {
            answer.push_str(&format!("{}\n", source.filename));
        }

        if source.table_rows.is_empty() {
            answer.push_str(source.snippet.trim());
            answer.push('\n');
        } else {
            for row in &source.table_rows {
                answer.push_str("| ");
                answer.push_str(&row.cells.join(" | "));
                answer.push_str(" |\n");
            }
        }
        answer.push('\n');
    }

    answer.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{DocumentType, TableRow};

    fn entry(snippet: &str, rows: Vec<TableRow>) -> ContextSourceEntry {
        ContextSourceEntry {
            chunk_id: "chunk-5".into(),
            document_id: "doc1".into(),
            filename: "catalog.pdf".into(),
            document_type: DocumentType::Catalog,
            section_path: Some("2.1".into()),
            title: None,
            page_number: Some(12),
            chunk_index: 5,
            snippet: snippet.into(),
            relevance: 0.8,
            boosts_applied: Vec::new(),
            table_rows: rows,
        }
    }

    #[test]
    fn from_config_uses_query_model() {
        let config = AppConfig {
            openai_api_key: "sk-test".to_owned(),
            openai_base_url: "http://localhost:1234/v1".to_owned(),
            embedding_model: "text-embedding-3-small".to_owned(),
            embedding_dimensions: 256,
            query_model: "gpt-4o-mini".to_owned(),
            reranking_enabled: false,
            reranking_pool_size: None,
            data_dir: "./data".to_owned(),
        };
        let generator = OpenAiAnswerGenerator::from_config(&config);
        assert_eq!(generator.model(), "gpt-4o-mini");
    }

    #[test]
    fn user_message_embeds_context_and_query() {
        let message = create_user_message("контекст здесь", "труба Стабил 16x2");
        assert!(message.contains("контекст здесь"));
        assert!(message.contains("труба Стабил 16x2"));
    }

    #[test]
    fn raw_answer_prefers_table_rows() {
        let rows = vec![TableRow {
            cells: vec!["Стабил 16x2".into(), "10 бар".into()],
        }];
        let answer = build_raw_answer(&[entry("текст не нужен", rows)]);
        assert!(answer.contains("| Стабил 16x2 | 10 бар |"));
        assert!(!answer.contains("текст не нужен"));
        assert!(answer.contains("раздел 2.1"));
    }

    #[test]
    fn raw_answer_falls_back_to_snippet() {
        let answer = build_raw_answer(&[entry("труба стабил, давление 10 бар", Vec::new())]);
        assert!(answer.contains("давление 10 бар"));
    }
}
