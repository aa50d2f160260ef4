use std::future::Future;

use async_trait::async_trait;

use crate::event::Event;

/// Consumes events of one type.
///
/// Errors are reported back to the bus, which logs them and moves on to the
/// next event. Handlers must not assume they run exactly once per publish:
/// delivery is best-effort.
///
/// Any `Fn(Event) -> impl Future<Output = anyhow::Result<()>>` closure is a handler:
///
/// ```ignore
/// bus.register("post.published", |event: Event| async move {
///     tracing::info!(payload = %event.payload, "post published");
///     Ok(())
/// });
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self)(event.clone()).await
    }
}
