//! Walkthrough of the event loop: timers, cross-thread submission, async
//! work, pins and fatal-exception recovery.
//!
//! Run with: cargo run -p tern-runtime --example demo

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tern_runtime::{
    ActivityHandle, Environment, FatalHandler, GuestResult, HostProcess, RuntimeConfig, Scope,
    ScriptError, Throw, spawn_loop,
};

/// Host whose fatal handler swallows everything but counts what it saw.
struct DemoHost {
    handler: Box<dyn FatalHandler>,
}

impl DemoHost {
    fn new(recovered: Arc<AtomicUsize>) -> Self {
        Self {
            handler: Box::new(move |_: &mut Scope<'_>, err: &ScriptError| {
                println!("  fatal handler recovered: {}", err.message());
                recovered.fetch_add(1, Ordering::SeqCst);
                true
            }),
        }
    }
}

impl HostProcess for DemoHost {
    fn fatal_handler(&mut self) -> Option<&mut dyn FatalHandler> {
        Some(self.handler.as_mut())
    }

    fn fire_exit(&mut self, _scope: &mut Scope<'_>, code: i32) -> GuestResult {
        println!("  exit event with code {}", code);
        Ok(())
    }
}

fn script(scope: &mut Scope<'_>) -> GuestResult {
    println!("  main running on {}", scope.name());

    let ticks = Arc::new(AtomicUsize::new(0));
    let own: Arc<Mutex<Option<ActivityHandle>>> = Arc::new(Mutex::new(None));
    let slot = own.clone();
    let interval = scope.create_timer(
        Duration::from_millis(20),
        true,
        Duration::from_millis(20),
        move |scope| {
            let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            println!("  interval tick {}", n);
            if n == 5 {
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    scope.cancel(me);
                }
            }
            Ok(())
        },
        None,
    );
    *own.lock().unwrap() = Some(interval);

    scope.submit(|_| Err(Throw::error("a contained failure")), None);

    scope.handle().run_async(
        || std::fs::read_to_string("Cargo.toml").map(|s| s.lines().count()),
        |_, lines: std::io::Result<usize>| {
            match lines {
                Ok(n) => println!("  async read finished: {} lines", n),
                Err(e) => println!("  async read failed: {}", e),
            }
            Ok(())
        },
        None,
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let config = RuntimeConfig::from_toml_str(
        r#"
[environment]
async_worker_threads = 2

[event_loop]
script_time_limit_ms = 1000
"#,
    )?;
    let env = Environment::new(config)?;
    let recovered = Arc::new(AtomicUsize::new(0));

    println!("=== Running demo loop ===");
    let host_recovered = recovered.clone();
    let mut thread = spawn_loop(
        &env,
        "demo-loop",
        move || Box::new(DemoHost::new(host_recovered)) as Box<dyn HostProcess>,
        Some(Box::new(script)),
    )?;

    // Keep the loop alive until a message from this thread has been delivered.
    let handle = thread.handle().clone();
    handle.pin();
    let releaser = handle.clone();
    handle.submit(
        move |_| {
            println!("  hello from the main thread");
            releaser.unpin().map_err(|e| Throw::error(e.to_string()))?;
            Ok(())
        },
        None,
    );

    let status = thread.wait().await?;
    println!(
        "=== Finished: {} (exit code {}, {} recovered) ===",
        status,
        status.exit_code(),
        recovered.load(Ordering::SeqCst)
    );
    Ok(())
}
