//! `login` command: authorize against a protected resource and list its
//! tools.

use std::sync::Arc;

use crate::auth::flow::{
    AuthorizationFlow, AuthorizationFlowConfig, BrowserLauncher, NoBrowser, RegistrationMode,
    SystemBrowser,
};
use crate::config::Config;
use crate::error::Result;

/// Logs in, prints the available tools and optionally calls one.
///
/// # Errors
///
/// Returns the flow error when authorization fails, or an error from the
/// resource server.
pub async fn run_login(config: Config, call_tool: Option<String>) -> Result<()> {
    let client = &config.client;
    let mode = RegistrationMode::from_config(client)?;
    let browser: Arc<dyn BrowserLauncher> = if client.open_browser {
        Arc::new(SystemBrowser)
    } else {
        Arc::new(NoBrowser)
    };

    let flow = AuthorizationFlow::new(
        reqwest::Client::new(),
        AuthorizationFlowConfig::from(client),
        browser,
    );

    tracing::info!(server_url = %client.server_url, dcr = client.use_dcr, "Starting login");
    let session = flow.authorize(&client.server_url, &mode).await?;
    println!(
        "Logged in as client {} (scopes: {})",
        session.info().client_id,
        session.info().scopes.join(" ")
    );

    let tools = session.list_tools().await?;
    println!("Available tools:");
    for tool in &tools {
        let name = tool.get("name").and_then(|n| n.as_str()).unwrap_or("?");
        let description = tool
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("");
        println!("  {name:<20} {description}");
    }

    if let Some(name) = call_tool {
        let result = session.call_tool(&name, serde_json::json!({})).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}
