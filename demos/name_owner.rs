use std::{
    env,
    time::{Duration, Instant},
};

use busproxy::{Argument, CallMode, Proxy, Session};

#[pollster::main]
async fn main() -> busproxy::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .init();

    let service = env::args()
        .nth(1)
        .unwrap_or_else(|| "org.freedesktop.Notifications".to_string());

    let session = Session::session().await?;
    let bus = Proxy::new_dynamic(
        &session,
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
    );
    println!("bus features: {:?}", bus.property("Features"));

    let reply = bus.call(
        CallMode::Block,
        "NameHasOwner",
        vec![Argument::new(service.as_str())],
    );
    println!("NameHasOwner({}): {:?}", service, reply.arguments());

    let proxy = Proxy::new_dynamic(&session, &service, "/", "");
    println!("{} is owned by '{}'", service, proxy.owner());
    if proxy.last_error().is_error() {
        println!("last error: {}", proxy.last_error());
    }

    println!("watching {} for 30 seconds...", service);
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut owner = proxy.owner();
    while Instant::now() < deadline {
        session
            .event_loop()
            .run_until(|| false, Some(Instant::now() + Duration::from_millis(250)));
        if proxy.owner() != owner {
            owner = proxy.owner();
            println!("owner changed to '{}' (valid: {})", owner, proxy.is_valid());
        }
    }

    Ok(())
}
