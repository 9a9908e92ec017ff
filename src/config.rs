use crate::llm::{LlmSettings, Provider, provider::DEFAULT_AZURE_API_VERSION};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory of persisted tool records (JSON or YAML)
    #[arg(long, env = "TOOLS_DIR")]
    pub tools_dir: Option<String>,

    /// Disable timeout middleware
    #[arg(long, env = "TIMEOUT_DISABLED")]
    pub timeout_disabled: Option<bool>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    /// Application id → platform functions it may call.
    #[serde(default)]
    pub applications: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub json: bool,
    /// Default filter when `RUST_LOG` is unset.
    pub filter: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    pub timeout_disabled: bool,
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone, Default)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub parallel_tool_calls: Option<bool>,
    pub azure_deployment_name: Option<String>,
    pub azure_api_version: Option<String>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .field("azure_deployment_name", &self.azure_deployment_name)
            .field("azure_api_version", &self.azure_api_version)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    pub directory: Option<String>,
    pub max_tool_iterations: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
                body_limit_bytes: 10 * 1024 * 1024,
            },
            logging: LoggingConfig {
                json: false,
                filter: "info".to_string(),
            },
            resilience: ResilienceConfig {
                timeout_disabled: false,
                request_timeout_secs: 120,
            },
            llm: LlmConfig::default(),
            tools: ToolsConfig {
                directory: None,
                max_tool_iterations: crate::llm::orchestrator::DEFAULT_MAX_TOOL_ITERATIONS,
            },
            applications: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layering, lowest to highest: defaults, legacy `LLM_*` variables,
    /// config file, `GATEWAY_`-prefixed environment, CLI flags.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        let defaults = Self::default();

        let mut builder = Config::builder()
            .set_default("server.port", defaults.server.port)?
            .set_default("server.host", defaults.server.host)?
            .set_default("server.body_limit_bytes", defaults.server.body_limit_bytes as u64)?
            .set_default("logging.json", defaults.logging.json)?
            .set_default("logging.filter", defaults.logging.filter)?
            .set_default("resilience.timeout_disabled", defaults.resilience.timeout_disabled)?
            .set_default(
                "resilience.request_timeout_secs",
                defaults.resilience.request_timeout_secs,
            )?
            .set_default("tools.max_tool_iterations", defaults.tools.max_tool_iterations as u64)?;

        // Legacy unprefixed variables sit just above the defaults.
        for (var, key) in [
            ("LLM_BASE_URL", "llm.base_url"),
            ("LLM_MODEL", "llm.model"),
            ("LLM_API_KEY", "llm.api_key"),
            ("AZURE_DEPLOYMENT_NAME", "llm.azure_deployment_name"),
            ("AZURE_API_VERSION", "llm.azure_api_version"),
        ] {
            if let Ok(val) = env::var(var) {
                if !val.trim().is_empty() {
                    builder = builder.set_default(key, val)?;
                }
            }
        }
        if let Some(parallel) = env::var("LLM_PARALLEL_TOOLS")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
        {
            builder = builder.set_default("llm.parallel_tool_calls", parallel)?;
        }

        // Config file: explicit path must exist, ./config.yaml is optional.
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path).required(true));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config.yaml").required(false));
        }

        // E.g. GATEWAY_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(dir) = cli.tools_dir {
            builder = builder.set_override("tools.directory", dir)?;
        }
        if let Some(td) = cli.timeout_disabled {
            builder = builder.set_override("resilience.timeout_disabled", td)?;
        }
        if let Some(json) = cli.log_json {
            builder = builder.set_override("logging.json", json)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }

    /// Provider settings, or `None` when no provider is configured.
    pub fn llm_settings(&self) -> anyhow::Result<Option<LlmSettings>> {
        let (Some(base_url), Some(model)) = (
            self.llm.base_url.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            self.llm.model.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        ) else {
            if self.llm.base_url.is_some() || self.llm.model.is_some() {
                anyhow::bail!("llm.base_url and llm.model must both be set");
            }
            return Ok(None);
        };

        let mut provider = Provider::detect_from_url(base_url);
        if let Provider::AzureOpenAI { .. } = provider {
            let deployment_name = self
                .llm
                .azure_deployment_name
                .clone()
                .unwrap_or_else(|| model.to_string());
            provider = Provider::AzureOpenAI {
                deployment_name,
                api_version: self
                    .llm
                    .azure_api_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            };
        }

        Ok(Some(LlmSettings {
            base_url: base_url.to_string(),
            api_key: self.llm.api_key.clone().filter(|s| !s.trim().is_empty()),
            model: model.to_string(),
            provider,
            parallel_tool_calls: self.llm.parallel_tool_calls,
        }))
    }
}
