use super::{Config, Secret};

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_store();
        self.apply_env_overrides_query();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("REPOPILOT_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid REPOPILOT_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("REPOPILOT_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("REPOPILOT_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("REPOPILOT_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("REPOPILOT_LLM_MAX_TOKENS")
            && let Ok(n) = v.parse::<u32>()
        {
            self.llm.max_tokens = n;
        }
        if let Ok(v) = std::env::var("REPOPILOT_LLM_API_KEY")
            && !v.is_empty()
        {
            self.secrets.llm_api_key = Some(Secret::new(v));
        }
    }

    fn apply_env_overrides_store(&mut self) {
        if let Ok(v) = std::env::var("REPOPILOT_QDRANT_URL") {
            self.store.qdrant_url = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("REPOPILOT_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("REPOPILOT_INDEX_MAX_FILE_SIZE")
            && let Ok(n) = v.parse::<u64>()
        {
            self.index.selector.max_file_size = n;
        }
        if let Ok(v) = std::env::var("REPOPILOT_INDEX_PARALLELISM")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.parallelism = n;
        }
    }

    fn apply_env_overrides_query(&mut self) {
        if let Ok(v) = std::env::var("REPOPILOT_QUERY_SEARCH_K")
            && let Ok(n) = v.parse::<usize>()
        {
            self.query.search_k = n;
        }
        if let Ok(v) = std::env::var("REPOPILOT_QUERY_TOP_N")
            && let Ok(n) = v.parse::<usize>()
        {
            self.query.top_n = n;
        }
        if let Ok(v) = std::env::var("REPOPILOT_TIMEOUT_GENERATION")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.timeouts.generation_secs = secs;
        }
        if let Ok(v) = std::env::var("REPOPILOT_TIMEOUT_EMBEDDING")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.timeouts.embedding_secs = secs;
        }
        if let Ok(v) = std::env::var("REPOPILOT_VERIFIER_LLM_REVIEW")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.verifier.llm_review = enabled;
        }
        if let Ok(v) = std::env::var("REPOPILOT_GATEWAY_BIND") {
            self.gateway.bind = v;
        }
        if let Ok(v) = std::env::var("REPOPILOT_GATEWAY_PORT")
            && let Ok(port) = v.parse::<u16>()
        {
            self.gateway.port = port;
        }
    }
}
