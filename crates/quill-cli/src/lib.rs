use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use clap::Parser;
use quill_client_core::{
    ApiClient, ApiError, ClientConfig, FileTokenStore, StreamSink, TracingNotifier,
};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Quill chat client")]
pub struct QuillCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Send a prompt and stream the assistant reply to stdout
    Chat(ChatArgs),
}

#[derive(clap::Args)]
pub struct ChatArgs {
    /// Prompt text for this turn
    pub prompt: String,

    /// Conversation to continue; a fresh one is created when omitted
    #[arg(long)]
    pub conversation: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = QuillCli::parse();
    match cli.command {
        Commands::Chat(args) => run_chat(args).await,
    }
}

async fn run_chat(args: ChatArgs) -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid client configuration")?;
    let store = Arc::new(FileTokenStore::new(state_dir()));
    let client = ApiClient::new(config, store, Arc::new(TracingNotifier));

    let conversation_id = match args.conversation {
        Some(id) => id,
        None => create_conversation(&client).await?,
    };

    let sink = Arc::new(StdoutSink::default());
    let handle = client.open_chat_stream(
        &conversation_id,
        serde_json::json!({ "prompt": args.prompt }),
        sink.clone(),
    );
    handle.join().await;

    if let Some(error) = sink.take_error() {
        return Err(anyhow::Error::new(error).context("chat stream failed"));
    }
    Ok(())
}

async fn create_conversation(client: &ApiClient) -> anyhow::Result<String> {
    #[derive(serde::Deserialize)]
    struct Created {
        id: String,
    }

    let created: Created = client
        .executor()
        .post_json("/api/conversations", &serde_json::json!({}))
        .await
        .context("failed to create conversation")?;
    Ok(created.id)
}

fn state_dir() -> std::path::PathBuf {
    std::env::var_os("QUILL_STATE_DIR")
        .map_or_else(|| std::env::temp_dir().join("quill"), Into::into)
}

/// Prints fragments as they arrive. The terminal error is kept so the
/// process can exit nonzero after the stream handle is joined.
#[derive(Default)]
struct StdoutSink {
    error: Mutex<Option<ApiError>>,
}

impl StdoutSink {
    fn take_error(&self) -> Option<ApiError> {
        self.error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[allow(clippy::print_stdout)]
impl StreamSink for StdoutSink {
    fn on_fragment(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_reconnecting(&self, attempt: u32) {
        tracing::warn!(attempt, "stream connection lost; reconnecting");
    }

    fn on_complete(&self) {
        println!();
    }

    fn on_error(&self, error: ApiError) {
        *self
            .error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(error);
    }
}
