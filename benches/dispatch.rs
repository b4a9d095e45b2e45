use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use kameo_gateway::{
    binding::BindingSpec,
    capability::CapabilityCatalog,
    client::ClientOptions,
    codec::to_payload,
    message::{Call, Context},
    packet::{Packet, Request},
    spawn,
    transport::memory,
    Actor, BindingFlags, BindingId, Capability, ChannelClient, GatewayBuilder, GatewayConfig,
};
use tokio::runtime::Builder;

const IECHO: Capability = Capability::from_static("IEcho");

struct EchoActor;

impl Actor for EchoActor {
    async fn handle(&mut self, call: Call, _ctx: Context) -> anyhow::Result<Bytes> {
        Ok(call.args)
    }
}

fn catalog() -> CapabilityCatalog {
    CapabilityCatalog::builder()
        .register(IECHO, ["Echo"])
        .build()
        .unwrap()
}

fn dispatch_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Gateway");
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let (gateway, client) = rt.block_on(async {
        let gateway = GatewayBuilder::new(GatewayConfig::passive())
            .catalog(catalog())
            .initial_bindings(|_channel, _info| {
                Ok(vec![BindingSpec::new(spawn(EchoActor), IECHO)
                    .with_flags(BindingFlags::STOP_ON_CLOSE)])
            })
            .start()
            .await
            .unwrap();

        let (client_conn, server_conn) = memory::pair(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        let accepting = gateway.clone();
        let accepted = tokio::spawn(async move { accepting.accept(server_conn).await });
        let client = ChannelClient::connect(client_conn, ClientOptions::default())
            .await
            .unwrap();
        accepted.await.unwrap().unwrap();
        (gateway, client)
    });

    // Dispatching straight into a channel, without any transport
    let channel = gateway.channels().remove(0);
    let payload = to_payload(&[0u8; 64]).unwrap();
    group.bench_function("dispatch_request", |b| {
        b.to_async(&rt).iter(|| async {
            let reply = channel
                .dispatch(Packet::Request {
                    correlation_id: 1,
                    request: Request {
                        binding_id: BindingId::new(1),
                        capability: IECHO,
                        method: "Echo".to_string(),
                        args: payload.clone(),
                    },
                })
                .await;
            assert!(reply.is_some());
        });
    });

    // A full round trip through the client, framing and the channel's read and write loops
    let echo = client.bound(BindingId::new(1), IECHO);
    group.bench_function("memory_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let reply: Vec<u8> = echo.ask("Echo", &[1u8, 2, 3, 4]).await.unwrap();
            assert_eq!(reply.len(), 4);
        });
    });

    group.finish();
    rt.block_on(async {
        client.close();
        gateway.stop().await.unwrap();
    });
}

criterion_group!(benches, dispatch_benchmarks);
criterion_main!(benches);
