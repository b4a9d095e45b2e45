#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use kameo_gateway::{
    binding::BindingSpec,
    capability::CapabilityCatalog,
    codec::to_payload,
    directory::{Directory, LocalDirectory},
    error::ChannelError,
    message::{Call, Context},
    observer::SubscriberToken,
    spawn, Actor, ActorRef, BindingFlags, BindingId, Capability, Gateway, GatewayBuilder,
    GatewayConfig, Interface, ReconnectToken, TransportKind,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kameo_gateway=warn")),
        )
        .with_test_writer()
        .try_init();
}

// ── Interfaces ──────────────────────────────────────────────────────────

pub struct IEntry;

impl Interface for IEntry {
    const CAPABILITY: Capability = Capability::from_static("IEntry");
    const METHODS: &'static [&'static str] = &[
        "GetGreeter",
        "GetGreeterOnAnotherChannel",
        "GetCounter",
        "GetCalculator",
    ];
}

pub struct IGreeter;

impl Interface for IGreeter {
    const CAPABILITY: Capability = Capability::from_static("IGreeter");
    const METHODS: &'static [&'static str] = &["Greet", "GetCount", "Subscribe", "Unsubscribe"];
}

pub struct IGreetObserver;

impl Interface for IGreetObserver {
    const CAPABILITY: Capability = Capability::from_static("IGreetObserver");
    const METHODS: &'static [&'static str] = &["Event"];
}

pub struct ICounter;

impl Interface for ICounter {
    const CAPABILITY: Capability = Capability::from_static("ICounter");
    const METHODS: &'static [&'static str] = &["IncCounter", "GetCounter"];
}

pub struct ICalculator;

impl Interface for ICalculator {
    const CAPABILITY: Capability = Capability::from_static("ICalculator");
    const METHODS: &'static [&'static str] = &["Sum", "Concat", "SlowSum", "Repeat"];
}

pub const IENTRY: Capability = IEntry::CAPABILITY;
pub const IGREETER: Capability = IGreeter::CAPABILITY;
pub const IGREET_OBSERVER: Capability = IGreetObserver::CAPABILITY;
pub const ICOUNTER: Capability = ICounter::CAPABILITY;
pub const ICALCULATOR: Capability = ICalculator::CAPABILITY;

pub fn catalog() -> CapabilityCatalog {
    CapabilityCatalog::builder()
        .interface::<IEntry>()
        .interface::<IGreeter>()
        .interface::<IGreetObserver>()
        .interface::<ICounter>()
        .interface::<ICalculator>()
        .build()
        .unwrap()
}

/// Where to find a greeter moved to the secondary gateway.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Handoff {
    pub addr: SocketAddr,
    pub token: ReconnectToken,
}

// ── Actors ──────────────────────────────────────────────────────────────

pub struct Entry {
    directory: Arc<dyn Directory>,
    secondary: Option<Gateway>,
}

impl Entry {
    fn bind(ctx: &Context, spec: BindingSpec) -> anyhow::Result<Bytes> {
        let channel = ctx
            .channel()
            .ok_or_else(|| anyhow::anyhow!("entry must be called through a channel"))?;
        let binding_id = match channel.bind_spec(spec) {
            Ok(binding_id) => binding_id,
            Err(ChannelError::DuplicateBinding { existing, .. }) => existing,
            Err(err) => return Err(err.into()),
        };
        Ok(to_payload(&binding_id)?)
    }
}

impl Actor for Entry {
    async fn handle(&mut self, call: Call, ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "GetGreeter" => {
                let greeter = self
                    .directory
                    .lookup("greeter")
                    .ok_or_else(|| anyhow::anyhow!("greeter is not registered"))?;
                Entry::bind(&ctx, BindingSpec::new(greeter, IGREETER))
            }
            "GetCounter" => Entry::bind(
                &ctx,
                BindingSpec::new(spawn(Counter::default()), ICOUNTER)
                    .with_flags(BindingFlags::STOP_ON_CLOSE),
            ),
            "GetCalculator" => Entry::bind(
                &ctx,
                BindingSpec::new(spawn(Calculator), ICALCULATOR)
                    .with_flags(BindingFlags::STOP_ON_CLOSE),
            ),
            "GetGreeterOnAnotherChannel" => {
                let secondary = self
                    .secondary
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no secondary gateway"))?;
                let addr = secondary
                    .connect_addr()
                    .ok_or_else(|| anyhow::anyhow!("secondary gateway is passive"))?;
                let greeter = spawn(Greeter::default());
                let token = secondary.issue_token(vec![
                    BindingSpec::new(greeter, IGREETER).with_flags(BindingFlags::STOP_ON_CLOSE)
                ])?;
                Ok(to_payload(&Handoff { addr, token })?)
            }
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

#[derive(Default)]
pub struct Greeter {
    count: i32,
}

impl Actor for Greeter {
    async fn handle(&mut self, call: Call, ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "Greet" => {
                let name: String = call.args()?;
                self.count += 1;
                ctx.publish(&IGREET_OBSERVER, to_payload(&format!("Greet({name})"))?);
                Ok(to_payload(&format!("Hello {name}!"))?)
            }
            "GetCount" => Ok(to_payload(&self.count)?),
            "Subscribe" => {
                let token: SubscriberToken = call.args()?;
                if let Some(channel) = ctx.channel() {
                    channel.subscribe(ctx.actor_id(), IGREET_OBSERVER, token)?;
                }
                Ok(to_payload(&())?)
            }
            "Unsubscribe" => {
                let token: SubscriberToken = call.args()?;
                if let Some(channel) = ctx.channel() {
                    channel.unsubscribe(ctx.actor_id(), &IGREET_OBSERVER, token);
                }
                Ok(to_payload(&())?)
            }
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

#[derive(Default)]
pub struct Counter {
    counter: i32,
}

impl Actor for Counter {
    async fn handle(&mut self, call: Call, _ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "IncCounter" => {
                let delta: i32 = call.args()?;
                if delta <= 0 {
                    anyhow::bail!("delta must be positive");
                }
                self.counter += delta;
                Ok(to_payload(&())?)
            }
            "GetCounter" => Ok(to_payload(&self.counter)?),
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

pub struct Calculator;

impl Actor for Calculator {
    async fn handle(&mut self, call: Call, _ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "Sum" => {
                let (a, b): (i32, i32) = call.args()?;
                Ok(to_payload(&(a + b))?)
            }
            "Concat" => {
                let (a, b): (String, Option<String>) = call.args()?;
                Ok(to_payload(&format!("{a}{}", b.unwrap_or_default()))?)
            }
            "SlowSum" => {
                let (a, b, delay_ms): (i32, i32, u64) = call.args()?;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(to_payload(&(a + b))?)
            }
            "Repeat" => {
                let (text, times): (String, usize) = call.args()?;
                Ok(to_payload(&text.repeat(times))?)
            }
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

// ── Servers ─────────────────────────────────────────────────────────────

pub struct Servers {
    pub primary: Gateway,
    pub secondary: Gateway,
    /// The greeter every entry hands out with `GetGreeter`.
    pub greeter: ActorRef,
}

impl Servers {
    pub async fn stop(&self) {
        self.primary.stop().await.unwrap();
        self.secondary.stop().await.unwrap();
    }
}

fn config(transport: TransportKind) -> GatewayConfig {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    match transport {
        TransportKind::Udp => GatewayConfig::udp(addr),
        _ => GatewayConfig::tcp(addr),
    }
}

/// Starts a primary gateway seeding each channel with an entry actor, and a token-only
/// secondary gateway the entry can move greeters to.
pub async fn start(transport: TransportKind) -> Servers {
    start_with(transport, |config| config).await
}

pub async fn start_with(
    transport: TransportKind,
    configure: impl Fn(GatewayConfig) -> GatewayConfig,
) -> Servers {
    init_tracing();

    let secondary = GatewayBuilder::new(configure(config(transport)).with_token_required(true))
        .catalog(catalog())
        .start()
        .await
        .unwrap();

    let greeter = spawn(Greeter::default());
    let directory = LocalDirectory::new();
    directory.insert("greeter", greeter.clone());
    let directory: Arc<dyn Directory> = Arc::new(directory);
    let entry_secondary = secondary.clone();
    let primary = GatewayBuilder::new(configure(config(transport)))
        .catalog(catalog())
        .initial_bindings(move |_channel, _info| {
            let entry = spawn(Entry {
                directory: directory.clone(),
                secondary: Some(entry_secondary.clone()),
            });
            Ok(vec![
                BindingSpec::new(entry, IENTRY).with_flags(BindingFlags::STOP_ON_CLOSE)
            ])
        })
        .start()
        .await
        .unwrap();

    Servers {
        primary,
        secondary,
        greeter,
    }
}

/// Waits until `f` holds, polling every few milliseconds.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn binding(payload: &Bytes) -> BindingId {
    kameo_gateway::codec::from_payload(payload).unwrap()
}
