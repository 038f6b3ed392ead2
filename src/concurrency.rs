//! Concurrency budget shared by checker and test-runner workers.
//!
//! The provider owns one token stream per worker kind. A stream is a growing
//! range `0..issued` plus a `closed` flag; pools subscribe to it and may keep
//! at most `issued` workers alive at once. Once checking is over the checker
//! share is handed to the test runners through [`ConcurrencyTokenProvider::free_checkers`].

use tokio::sync::watch;
use tracing::info;

/// Slot number of a pooled worker.
pub type ConcurrencyToken = usize;

/// Snapshot of a token stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenState {
    /// Tokens `0..issued` have been released.
    pub issued: usize,
    /// No more tokens will follow.
    pub closed: bool,
}

/// Receiving end of a token stream.
#[derive(Debug, Clone)]
pub struct TokenStream {
    rx: watch::Receiver<TokenState>,
}

impl TokenStream {
    /// A stream with a fixed set of tokens that is already closed.
    pub fn fixed(count: usize) -> Self {
        let (_tx, rx) = watch::channel(TokenState {
            issued: count,
            closed: true,
        });
        Self { rx }
    }

    pub fn snapshot(&self) -> TokenState {
        *self.rx.borrow()
    }

    /// Read the current state and mark it as seen for [`TokenStream::changed`].
    pub fn mark_seen(&mut self) -> TokenState {
        *self.rx.borrow_and_update()
    }

    /// Wait until the state differs from the last one seen.
    ///
    /// Returns `false` once the provider is gone and nothing can change anymore.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait for the stream to close and return every token it released.
    pub async fn collect(mut self) -> Vec<ConcurrencyToken> {
        let closed = self.rx.wait_for(|s| s.closed).await.map(|s| s.issued).ok();
        let issued = closed.unwrap_or_else(|| self.rx.borrow().issued);
        (0..issued).collect()
    }
}

/// Splits the configured concurrency between checkers and test runners.
#[derive(Debug)]
pub struct ConcurrencyTokenProvider {
    concurrency: usize,
    checker_count: usize,
    test_runner_tx: watch::Sender<TokenState>,
    checker_tx: watch::Sender<TokenState>,
}

impl ConcurrencyTokenProvider {
    pub fn new(concurrency: Option<usize>, has_checkers: bool) -> Self {
        Self::with_cpu_count(concurrency, has_checkers, available_cpus())
    }

    /// Like [`ConcurrencyTokenProvider::new`] with an explicit CPU count.
    pub fn with_cpu_count(concurrency: Option<usize>, has_checkers: bool, cpu_count: usize) -> Self {
        let concurrency = concurrency
            .unwrap_or_else(|| default_concurrency(cpu_count))
            .max(1);

        if has_checkers {
            let checker_count = concurrency.div_ceil(2);
            // A single slot still needs one test runner for the dry run.
            let test_runner_count = (concurrency / 2).max(1);
            info!(
                concurrency,
                checkers = checker_count,
                test_runners = test_runner_count,
                "Creating {} checker process(es) and {} test runner process(es)",
                checker_count,
                test_runner_count
            );

            Self {
                concurrency,
                checker_count,
                test_runner_tx: watch::Sender::new(TokenState {
                    issued: test_runner_count,
                    closed: false,
                }),
                checker_tx: watch::Sender::new(TokenState {
                    issued: checker_count,
                    closed: true,
                }),
            }
        } else {
            info!(
                concurrency,
                "Creating {} test runner process(es)", concurrency
            );

            Self {
                concurrency,
                checker_count: 0,
                test_runner_tx: watch::Sender::new(TokenState {
                    issued: concurrency,
                    closed: true,
                }),
                // One slot so a checker pool still works without starting a process.
                checker_tx: watch::Sender::new(TokenState {
                    issued: 1,
                    closed: true,
                }),
            }
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn checker_count(&self) -> usize {
        self.checker_count
    }

    pub fn test_runner_tokens(&self) -> TokenStream {
        TokenStream {
            rx: self.test_runner_tx.subscribe(),
        }
    }

    pub fn checker_tokens(&self) -> TokenStream {
        TokenStream {
            rx: self.checker_tx.subscribe(),
        }
    }

    /// Hand the checker share to the test runners and close their stream.
    ///
    /// Afterwards the test-runner stream has released `concurrency` tokens in
    /// total. Calling this again, or after [`dispose`](Self::dispose), is a no-op.
    pub fn free_checkers(&self) {
        let concurrency = self.concurrency;
        let freed = self.test_runner_tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.issued = state.issued.max(concurrency);
            state.closed = true;
            true
        });
        if freed {
            info!(
                test_runners = concurrency,
                "Checkers done, test runners may use all {} slot(s)", concurrency
            );
        }
    }

    /// Close both streams without releasing further tokens.
    pub fn dispose(&self) {
        for tx in [&self.test_runner_tx, &self.checker_tx] {
            tx.send_if_modified(|state| !std::mem::replace(&mut state.closed, true));
        }
    }
}

/// CPU count if at most 4, otherwise one less to leave room for the orchestrator.
fn default_concurrency(cpu_count: usize) -> usize {
    if cpu_count <= 4 {
        cpu_count
    } else {
        cpu_count - 1
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_with_checkers_nine() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(9), true, 2);
        provider.free_checkers();
        assert_eq!(provider.checker_tokens().collect().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(provider.checker_count(), 5);
    }

    #[test]
    fn test_split_with_checkers_seven() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(7), true, 2);
        assert_eq!(
            provider.checker_tokens().snapshot(),
            TokenState {
                issued: 4,
                closed: true
            }
        );
        assert_eq!(
            provider.test_runner_tokens().snapshot(),
            TokenState {
                issued: 3,
                closed: false
            }
        );
    }

    #[tokio::test]
    async fn test_free_checkers_reclaims_capacity() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(8), true, 2);
        let mut stream = provider.test_runner_tokens();
        assert_eq!(stream.mark_seen().issued, 4);

        provider.free_checkers();
        assert!(stream.changed().await);
        assert_eq!(stream.clone().collect().await, (0..8).collect::<Vec<_>>());

        // Second call must not notify again
        provider.free_checkers();
        assert_eq!(stream.mark_seen().issued, 8);
    }

    #[tokio::test]
    async fn test_no_checkers_uses_cpu_count() {
        let four = ConcurrencyTokenProvider::with_cpu_count(None, false, 4);
        assert_eq!(four.test_runner_tokens().collect().await, vec![0, 1, 2, 3]);
        assert_eq!(four.checker_tokens().collect().await, vec![0]);

        let five = ConcurrencyTokenProvider::with_cpu_count(None, false, 5);
        assert_eq!(five.test_runner_tokens().collect().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dispose_closes_open_stream() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(4), true, 2);
        let stream = provider.test_runner_tokens();
        let collector = tokio::spawn(stream.collect());

        provider.dispose();
        assert_eq!(collector.await.unwrap(), vec![0, 1]);

        // Freeing after dispose releases nothing
        provider.free_checkers();
        assert_eq!(provider.test_runner_tokens().snapshot().issued, 2);
    }

    #[test]
    fn test_single_slot_with_checkers() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(1), true, 8);
        assert_eq!(provider.test_runner_tokens().snapshot().issued, 1);
        assert_eq!(provider.checker_tokens().snapshot().issued, 1);
        provider.free_checkers();
        assert_eq!(provider.test_runner_tokens().snapshot().issued, 1);
    }

    #[test]
    fn test_fixed_stream() {
        let stream = TokenStream::fixed(3);
        assert_eq!(
            stream.snapshot(),
            TokenState {
                issued: 3,
                closed: true
            }
        );
    }
}
