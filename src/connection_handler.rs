use async_trait::async_trait;

// Trait for opening tunneling channels back to the SSH connection that
// registered an endpoint (via an underlying SSH session).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait ConnectionHandler<T: Send + Sync + 'static> {
    // Return a new tunneling channel for one inbound connection.
    async fn tunneling_channel(&self) -> anyhow::Result<T>;
}
