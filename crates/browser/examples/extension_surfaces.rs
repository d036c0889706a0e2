//! Extension surfaces example - watch the surfaces of an unpacked extension
//!
//! Usage: extension_surfaces <extension-dir> [ws-url]
//!
//! Prints the command line to start Chrome with, then connects to it.

use browser_surfaces::{BrowserSession, ContextEvent, PersistentLaunchOptions, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut argv = std::env::args().skip(1);
    let extension = PathBuf::from(argv.next().ok_or("missing extension directory")?);
    let cdp_url = argv
        .next()
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());

    let user_data_dir = std::env::temp_dir().join("browser-surfaces-example");
    let options = PersistentLaunchOptions::new(&user_data_dir)
        .with_headless(true)
        .with_extension(&extension)
        .with_args(["--remote-debugging-port=9222"])
        .with_timeout(Duration::from_secs(30));
    println!("Start Chrome with: {}", options.launch_args()?.join(" "));

    let session = BrowserSession::new(SessionConfig {
        cdp_url,
        ..Default::default()
    });
    let context = session.start_persistent(&options).await?;
    println!("Connected, profile {}", user_data_dir.display());

    // Print everything the context reports
    let mut events = context.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                ContextEvent::Request(request) => {
                    println!("request  {} {} ({})", request.method(), request.url(), request.target_id())
                }
                ContextEvent::Console(message) => println!("console  [{}] {}", message.kind(), message.text()),
                other => println!("event    {}", other.kind()),
            }
        }
    });

    // Manifest v3 extensions run in a service worker, v2 in a background page
    let surface = tokio::select! {
        sw = context.wait_for_service_worker(|s| s.url().starts_with("chrome-extension://"), None) => sw?,
        bg = context.wait_for_background_page(|_| true, None) => bg?,
    };
    println!(
        "Extension {} running in {:?} at {}",
        surface.extension_id().unwrap_or_default(),
        surface.kind(),
        surface.url()
    );

    let manifest = surface.evaluate("chrome.runtime.getManifest()").await?;
    println!("Manifest: {}", manifest);

    println!("Pages: {}", context.pages().len());
    println!("Background pages: {}", context.background_pages().len());
    println!("Service workers: {}", context.service_workers().len());

    tokio::time::sleep(Duration::from_secs(2)).await;

    session.stop().await?;
    println!("Stopped");

    Ok(())
}
