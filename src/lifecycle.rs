use std::future::Future;

/// Lazily established backing handle shared by the writers: disconnected until
/// `ready_or_init` succeeds.
///
/// A failed init leaves the handle disconnected, so the next call retries
/// from scratch instead of caching a half-built state.
#[derive(Debug)]
pub struct Lifecycle<T> {
    ready: Option<T>,
}

impl<T> Default for Lifecycle<T> {
    fn default() -> Self {
        Self { ready: None }
    }
}

impl<T> Lifecycle<T> {
    pub fn get(&self) -> Option<&T> {
        self.ready.as_ref()
    }

    pub async fn ready_or_init<E, F, Fut>(&mut self, init: F) -> Result<&mut T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = match self.ready.take() {
            Some(value) => value,
            None => init().await?,
        };
        Ok(self.ready.insert(value))
    }

    /// Drops the handle; the next `ready_or_init` starts over.
    pub fn reset(&mut self) -> Option<T> {
        self.ready.take()
    }
}
