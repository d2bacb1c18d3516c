//! Demo routes served by the `tbrpc-server` binary.

use anyhow::anyhow;
use serde_json::{json, Value};
use tbrpc::{ConnectionContext, ServerRoutes};
use tracing::debug;

/// Routes every client can call.
pub fn demo_routes() -> ServerRoutes {
    ServerRoutes::new()
        .typed_route("ping", |_ctx, (): ()| async move { Ok("pong") })
        .typed_route("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
        .route("echo", |_ctx, args| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .typed_route("whoami", |ctx: ConnectionContext, (): ()| async move {
            Ok(ctx.id.to_string())
        })
        .typed_route("peers", |ctx: ConnectionContext, (): ()| async move {
            Ok(ctx
                .clients
                .ids()
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>())
        })
        .typed_route("broadcast", handle_broadcast)
        .typed_route("fail", |_ctx, (message,): (String,)| async move {
            Err::<Value, _>(anyhow!(message))
        })
}

/// Calls `notify(from, message)` on every other client; returns how many
/// acknowledged.
async fn handle_broadcast(ctx: ConnectionContext, (message,): (String,)) -> anyhow::Result<usize> {
    let from = ctx.id.to_string();
    let calls = ctx
        .clients
        .broadcast("notify", vec![json!(from), json!(message)], Some(ctx.id));

    let outcomes = futures::future::join_all(
        calls
            .into_iter()
            .map(|(id, call)| async move { (id, call.await) }),
    )
    .await;

    let mut acknowledged = 0;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(_) => acknowledged += 1,
            Err(e) => debug!("Broadcast to {} not acknowledged: {}", id, e),
        }
    }
    Ok(acknowledged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbrpc::{ChannelTransport, Peer, RouteTable, RpcOptions, ServerRouter};

    #[test]
    fn test_demo_route_names() {
        assert_eq!(
            demo_routes().names(),
            vec!["add", "broadcast", "echo", "fail", "peers", "ping", "whoami"]
        );
    }

    #[tokio::test]
    async fn test_fail_route_reports_message() {
        let router = ServerRouter::builder().routes(demo_routes()).build();
        let (server_side, client_side) = ChannelTransport::pair();
        let _connection = router.accept(server_side);
        let client = Peer::new(client_side, RouteTable::new(), RpcOptions::default());

        let err = client.call::<Value, _>("fail", ("boom",)).await.unwrap_err();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.code, -32603);
        assert_eq!(remote.message, "boom");
    }

    #[tokio::test]
    async fn test_echo_returns_first_argument() {
        let router = ServerRouter::builder().routes(demo_routes()).build();
        let (server_side, client_side) = ChannelTransport::pair();
        let _connection = router.accept(server_side);
        let client = Peer::new(client_side, RouteTable::new(), RpcOptions::default());

        let echoed = client
            .invoke("echo", vec![json!({"nested": [1, 2]})])
            .await
            .unwrap();
        assert_eq!(echoed, json!({"nested": [1, 2]}));
    }
}
