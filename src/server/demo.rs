//! Demo hub served by `hubwire serve`
//!
//! | Method | Kind | Description |
//! |--------|------|-------------|
//! | `Echo(text)` | unary | returns `text` |
//! | `Concat(a, b)` | unary | returns `"{a}{b}"` |
//! | `Broadcast(message)` | void | sends `Receive(user, message)` to everyone |
//! | `JoinGroup(group)` / `LeaveGroup(group)` | void | group membership |
//! | `SendToGroup(group, message)` | void | sends `Receive(user, message)` to the group |
//! | `Counter(count, delay_ms)` | stream | yields `0..count` |
//! | `Sum(numbers)` | unary, upload | sums an uploaded stream of integers |
//! | `AskName()` | unary | invokes `GetName` on the caller and returns the answer |
//! | `Stats()` | unary | broadcast count since start |

use crate::hub::{
    Arg, FromServices, Hub, HubContext, HubDefinition, HubError, HubResult, ServiceCollection,
    ServiceProvider, UploadStream,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct DemoHub;

#[async_trait]
impl Hub for DemoHub {
    async fn on_connected(&self, ctx: &HubContext) -> HubResult<()> {
        tracing::info!("Demo client {} connected", ctx.connection_id());
        Ok(())
    }
}

/// Process-wide counters shared through the service provider
#[derive(Debug, Default)]
pub struct DemoStats {
    broadcasts: AtomicU64,
}

fn caller_name(ctx: &HubContext) -> String {
    ctx.user()
        .id
        .clone()
        .unwrap_or_else(|| ctx.connection_id().to_string())
}

async fn echo(_hub: Arc<DemoHub>, _ctx: HubContext, Arg(text): Arg<String>) -> HubResult<String> {
    Ok(text)
}

async fn concat(
    _hub: Arc<DemoHub>,
    _ctx: HubContext,
    Arg(a): Arg<String>,
    Arg(b): Arg<String>,
) -> HubResult<String> {
    Ok(format!("{}{}", a, b))
}

async fn broadcast(
    _hub: Arc<DemoHub>,
    ctx: HubContext,
    Arg(message): Arg<String>,
    FromServices(stats): FromServices<DemoStats>,
) -> HubResult<()> {
    stats.broadcasts.fetch_add(1, Ordering::Relaxed);
    ctx.clients()
        .all()
        .send("Receive", vec![json!(caller_name(&ctx)), json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn join_group(_hub: Arc<DemoHub>, ctx: HubContext, Arg(group): Arg<String>) -> HubResult<()> {
    ctx.groups().add_to_connection(ctx.connection_id(), &group);
    Ok(())
}

async fn leave_group(_hub: Arc<DemoHub>, ctx: HubContext, Arg(group): Arg<String>) -> HubResult<()> {
    ctx.groups().remove_from_connection(ctx.connection_id(), &group);
    Ok(())
}

async fn send_to_group(
    _hub: Arc<DemoHub>,
    ctx: HubContext,
    Arg(group): Arg<String>,
    Arg(message): Arg<String>,
) -> HubResult<()> {
    ctx.clients()
        .group(&group)
        .send("Receive", vec![json!(caller_name(&ctx)), json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn counter(
    _hub: Arc<DemoHub>,
    _ctx: HubContext,
    Arg(count): Arg<u32>,
    Arg(delay_ms): Arg<u64>,
) -> HubResult<impl Stream<Item = HubResult<u32>>> {
    let delay = Duration::from_millis(delay_ms);
    Ok(futures::stream::iter(0..count).then(move |i| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, HubError>(i)
    }))
}

async fn sum(_hub: Arc<DemoHub>, _ctx: HubContext, numbers: UploadStream<i64>) -> HubResult<i64> {
    numbers
        .try_fold(0i64, |acc, n| async move { Ok::<_, HubError>(acc + n) })
        .await
}

async fn ask_name(_hub: Arc<DemoHub>, ctx: HubContext) -> HubResult<String> {
    ctx.clients()
        .caller()
        .invoke::<String>("GetName", vec![], &ctx.connection_aborted())
        .await
        .map_err(|e| HubError::new(e.to_string()))
}

async fn stats(
    _hub: Arc<DemoHub>,
    _ctx: HubContext,
    FromServices(stats): FromServices<DemoStats>,
) -> HubResult<u64> {
    Ok(stats.broadcasts.load(Ordering::Relaxed))
}

/// Method table of the demo hub
pub fn demo_definition() -> anyhow::Result<HubDefinition<DemoHub>> {
    Ok(HubDefinition::builder()
        .method("Echo", echo)
        .method("Concat", concat)
        .method("Broadcast", broadcast)
        .method("JoinGroup", join_group)
        .method("LeaveGroup", leave_group)
        .method("SendToGroup", send_to_group)
        .stream_method("Counter", counter)
        .method("Sum", sum)
        .method("AskName", ask_name)
        .method("Stats", stats)
        .build()?)
}

/// Services the demo hub resolves
pub fn demo_services() -> ServiceProvider {
    let mut services = ServiceCollection::new();
    services.add_singleton(DemoStats::default());
    services.build()
}
