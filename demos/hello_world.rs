use bytes::Bytes;
use futures::StreamExt;
use kameo_gateway::{
    binding::BindingSpec,
    capability::CapabilityCatalog,
    client::ClientOptions,
    codec::{from_payload, to_payload},
    message::{Call, Context},
    observer::SubscriberToken,
    spawn, Actor, BindingFlags, BindingId, Capability, ChannelClient, Gateway, GatewayBuilder,
    GatewayConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const IENTRY: Capability = Capability::from_static("IEntry");
const IGREETER: Capability = Capability::from_static("IGreeter");
const IGREET_OBSERVER: Capability = Capability::from_static("IGreetObserver");

// Handed to every new channel; binds greeters on request
struct Entry {
    secondary: Gateway,
}

impl Actor for Entry {
    async fn handle(&mut self, call: Call, ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "GetGreeter" => {
                let channel = ctx
                    .channel()
                    .ok_or_else(|| anyhow::anyhow!("not called through a channel"))?;
                let binding_id = channel.bind(
                    spawn(Greeter::default()),
                    IGREETER,
                    BindingFlags::STOP_ON_CLOSE,
                )?;
                Ok(to_payload(&binding_id)?)
            }
            "GetGreeterOnAnotherChannel" => {
                let token = self.secondary.issue_token(vec![BindingSpec::new(
                    spawn(Greeter::default()),
                    IGREETER,
                )
                .with_flags(BindingFlags::STOP_ON_CLOSE)])?;
                Ok(to_payload(&token)?)
            }
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

#[derive(Default)]
struct Greeter {
    count: u32,
}

impl Actor for Greeter {
    async fn handle(&mut self, call: Call, ctx: Context) -> anyhow::Result<Bytes> {
        match call.method.as_str() {
            "Greet" => {
                let name: String = call.args()?;
                self.count += 1;
                ctx.publish(&IGREET_OBSERVER, to_payload(&format!("greeted {name}"))?);
                Ok(to_payload(&format!("Hello {name}! (#{})", self.count))?)
            }
            "Subscribe" => {
                let token: SubscriberToken = call.args()?;
                if let Some(channel) = ctx.channel() {
                    channel.subscribe(ctx.actor_id(), IGREET_OBSERVER, token)?;
                }
                Ok(to_payload(&())?)
            }
            method => anyhow::bail!("unhandled method {method}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .without_time()
        .with_target(false)
        .init();

    let catalog = CapabilityCatalog::builder()
        .register(IENTRY, ["GetGreeter", "GetGreeterOnAnotherChannel"])
        .register(IGREETER, ["Greet", "Subscribe"])
        .register(IGREET_OBSERVER, ["Event"])
        .build()?;

    let secondary = GatewayBuilder::new(
        GatewayConfig::tcp("127.0.0.1:0".parse()?).with_token_required(true),
    )
    .catalog(catalog.clone())
    .start()
    .await?;

    let entry_secondary = secondary.clone();
    let primary = GatewayBuilder::new(GatewayConfig::tcp("127.0.0.1:0".parse()?))
        .catalog(catalog)
        .initial_bindings(move |_channel, _info| {
            let entry = spawn(Entry {
                secondary: entry_secondary.clone(),
            });
            Ok(vec![
                BindingSpec::new(entry, IENTRY).with_flags(BindingFlags::STOP_ON_CLOSE)
            ])
        })
        .start()
        .await?;

    let addr = primary.local_addr().ok_or("primary is not listening")?;
    let client = ChannelClient::connect_tcp(addr, ClientOptions::default()).await?;
    let entry = client.bound(client.binding_for(&IENTRY).ok_or("no entry bound")?, IENTRY);

    let greeter: BindingId = entry.ask("GetGreeter", &()).await?;
    let greeter = client.bound(greeter, IGREETER);
    let mut events = client.events().ok_or("events already taken")?;
    greeter
        .ask::<_, ()>("Subscribe", &SubscriberToken::new(1))
        .await?;

    for name in ["Alice", "Bob"] {
        let greeting: String = greeter.ask("Greet", name).await?;
        info!("{greeting}");
        if let Some((token, payload)) = events.next().await {
            let event: String = from_payload(&payload)?;
            info!(%token, %event, "observed");
        }
    }

    let token = entry.ask("GetGreeterOnAnotherChannel", &()).await?;
    let addr = secondary.connect_addr().ok_or("secondary is not listening")?;
    let moved = ChannelClient::connect_tcp(addr, ClientOptions::default().with_token(token)).await?;
    let greeter = moved.bound(moved.binding_for(&IGREETER).ok_or("no greeter moved")?, IGREETER);
    let greeting: String = greeter.ask("Greet", "Carol").await?;
    info!(channel_id = %moved.channel_id(), "{greeting}");

    primary.stop().await?;
    secondary.stop().await?;

    Ok(())
}
