use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use busproxy::{
    interface::{InterfaceDescriptor, MethodDescriptor, SignalDescriptor},
    Argument, Proxy, Session,
};
use zbus::zvariant::Value;

// https://specifications.freedesktop.org/notification-spec/latest/
const NOTIFICATIONS: InterfaceDescriptor = InterfaceDescriptor {
    name: "org.freedesktop.Notifications",
    methods: &[
        MethodDescriptor::new("Notify", "susssasa{sv}i", "u"),
        MethodDescriptor::new("CloseNotification", "u", "").no_reply(),
        MethodDescriptor::new("GetServerInformation", "", "ssss"),
    ],
    signals: &[
        SignalDescriptor::new("NotificationClosed", "uu"),
        SignalDescriptor::new("ActionInvoked", "us"),
    ],
    properties: &[],
};

#[pollster::main]
async fn main() -> busproxy::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::session().await?;
    let proxy = Proxy::new(
        &session,
        "org.freedesktop.Notifications",
        "/org/freedesktop/Notifications",
        &NOTIFICATIONS,
    );
    if !proxy.is_valid() {
        eprintln!("no notification server: {}", proxy.last_error());
        return Ok(());
    }
    println!("notification server is {}", proxy.owner());

    let info = proxy.call_method("GetServerInformation", Vec::new());
    if info.is_error() {
        eprintln!("GetServerInformation failed: {}", proxy.last_error());
    } else {
        println!("server information: {:?}", info.arguments());
    }

    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    proxy.connect_signal("NotificationClosed", move |signal| {
        println!("notification closed: {:?}", signal.arguments());
        flag.store(true, Ordering::SeqCst);
    });

    let reply = proxy.call_method(
        "Notify",
        vec![
            Argument::new(env!("CARGO_PKG_NAME")),
            Argument::new(0u32),
            Argument::new(""),
            Argument::new("Hello"),
            Argument::new("Sent through a busproxy proxy"),
            Argument::new(Vec::<String>::new()),
            Argument::new(HashMap::<&str, Value<'_>>::new()),
            Argument::new(3000i32),
        ],
    );
    if reply.is_error() {
        eprintln!("Notify failed: {}", proxy.last_error());
        return Ok(());
    }
    println!("notification id: {:?}", reply.arguments()[0]);

    let deadline = Instant::now() + Duration::from_secs(10);
    if !session
        .event_loop()
        .run_until(|| closed.load(Ordering::SeqCst), Some(deadline))
    {
        eprintln!("notification was not closed within 10 seconds");
    }

    Ok(())
}
