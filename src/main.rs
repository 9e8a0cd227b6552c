use anyhow::{anyhow, bail, Context, Result};
use mcp_dash::{
    config, logging, ApiClient, DashConfig, OrchestrationEvent, ServerFilter, StreamEvent,
    TaskPhase, TaskTracker,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_path = config::load_dotenv();
    let config = DashConfig::from_env().context("Failed to read MCP_DASH_* configuration")?;
    let level = config.level()?;

    let logging_ready = if config.log_to_file {
        logging::init(level)
    } else {
        logging::init_simple(level)
    };
    logging_ready.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    match dotenv_path {
        Some(path) => info!("Loaded environment from {}", path.display()),
        None => info!("No .env file found, using process environment"),
    }

    let api = ApiClient::from_config(&config)?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [] => overview(&api).await,
        [server_id, prompt @ ..] if !prompt.is_empty() => {
            run_task(&api, &config, server_id, &prompt.join(" ")).await
        }
        _ => bail!("usage: mcp-dash [<server_id> <prompt...>]"),
    }
}

/// Print platform health and the known servers
async fn overview(api: &ApiClient) -> Result<()> {
    let health = api
        .health()
        .await
        .with_context(|| format!("API at {} is not reachable", api.base_url()))?;
    println!(
        "{} ({} servers registered)",
        health.status, health.servers_registered
    );

    for server in api.list_servers(ServerFilter::default()).await? {
        let tools = server.tool_names();
        println!(
            "{:<14} {:<10} {:<8} {} [{} tools]",
            server.id,
            server.status,
            server.deploy_method,
            server.name,
            tools.len()
        );
    }
    Ok(())
}

/// Stream an orchestration task to the console until it finishes
async fn run_task(api: &ApiClient, config: &DashConfig, server_id: &str, prompt: &str) -> Result<()> {
    let (client, mut events) =
        api.orchestrate_stream(server_id, prompt, None, config.reconnect_policy())?;
    let mut tracker = TaskTracker::new(server_id, prompt);
    info!("Task {} started on {}", tracker.progress().id, server_id);

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, closing stream");
                client.close();
                break;
            }
        };

        let Some(event) = event else { break };
        render(&event, tracker.observe(&event));

        if tracker.is_finished() {
            // The server ends the stream after the last event; don't reconnect
            client.close();
            break;
        }
        if matches!(event, StreamEvent::Close) {
            break;
        }
    }

    let progress = tracker.progress();
    match progress.phase {
        TaskPhase::Completed => {
            if let Some(response) = &progress.response {
                println!("\n{}", serde_json::to_string_pretty(response)?);
            }
            Ok(())
        }
        TaskPhase::Failed => bail!(
            "Task failed: {}",
            progress.error.as_deref().unwrap_or("unknown error")
        ),
        phase => bail!("Stream ended while task was {:?}", phase),
    }
}

fn render(event: &StreamEvent, decoded: Option<OrchestrationEvent>) {
    match (event, decoded) {
        (StreamEvent::Reconnecting { attempt, delay, max_attempts }, _) => {
            println!("  … reconnecting in {:?} ({}/{})", delay, attempt, max_attempts);
        }
        (StreamEvent::MaxReconnectAttempts { .. }, _) => {
            println!("  ✗ connection lost, retry manually");
        }
        (_, Some(OrchestrationEvent::ExecutingStep { step_index, total_steps, description, .. })) => {
            println!("  [{}/{}] {}", step_index, total_steps, description);
        }
        (_, Some(OrchestrationEvent::ToolResult { tool, success, .. })) => {
            println!("  {} {}", if success { "✓" } else { "✗" }, tool);
        }
        (_, Some(OrchestrationEvent::ToolError { tool, error })) => {
            println!("  ✗ {}: {}", tool, error);
        }
        (_, Some(OrchestrationEvent::Connecting { message }))
        | (_, Some(OrchestrationEvent::Discovering { message }))
        | (_, Some(OrchestrationEvent::Planning { message }))
        | (_, Some(OrchestrationEvent::Finalizing { message })) => {
            println!("  {}", message);
        }
        _ => {}
    }
}
