//! 单飞（single-flight）原语：并发调用合并为一次底层操作并扇出结果。
//!
//! # 契约（What）
//! - 首个调用者触发操作，后续调用者在操作完成前排队；完成后所有调用者同时得到同一结果；
//! - 成功后进入 `Done` 终态，之后的调用立即返回 `Ok(())`，不再访问网络；
//! - 失败后回到 `Idle`，下一个调用者重新触发；
//! - [`SingleFlight::reset`] 以给定错误拒绝全部排队者并回到 `Idle`；被重置前已在途的操作
//!   完成时因世代号不匹配而被忽略。
//!
//! # 执行逻辑（How）
//! - 操作派生到当前 Tokio 运行时执行，调用者只等待 `oneshot`；首个调用者的 future 被丢弃
//!   不会让其他排队者悬挂；
//! - 无运行时时退化为由首个调用者就地驱动。

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

type Waiter<E> = oneshot::Sender<Result<(), E>>;

enum FlightState<E> {
    Idle,
    InFlight { waiters: Vec<Waiter<E>> },
    Done,
}

struct Inner<E> {
    state: FlightState<E>,
    generation: u64,
}

/// 单飞原语。`E` 需可克隆，以便扇出给每个等待者。
pub struct SingleFlight<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Default for SingleFlight<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: FlightState::Idle,
                generation: 0,
            }),
        }
    }
}

enum Entry<E> {
    Done,
    Wait(oneshot::Receiver<Result<(), E>>),
    Lead(u64, oneshot::Receiver<Result<(), E>>),
}

impl<E> SingleFlight<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已成功完成。
    pub fn is_done(&self) -> bool {
        matches!(self.inner.lock().state, FlightState::Done)
    }

    /// 是否有操作在途。
    pub fn is_in_flight(&self) -> bool {
        matches!(self.inner.lock().state, FlightState::InFlight { .. })
    }

    /// 执行或加入一次操作。
    ///
    /// `op` 只会在当前调用成为首个调用者时被调用；`abandoned` 用于等待通道意外关闭时的错误。
    pub async fn run<F, Fut>(self: &Arc<Self>, op: F, abandoned: E) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let entry = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                FlightState::Done => Entry::Done,
                FlightState::InFlight { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Entry::Wait(rx)
                }
                FlightState::Idle => {
                    let (tx, rx) = oneshot::channel();
                    inner.generation += 1;
                    inner.state = FlightState::InFlight { waiters: vec![tx] };
                    Entry::Lead(inner.generation, rx)
                }
            }
        };

        match entry {
            Entry::Done => Ok(()),
            Entry::Wait(rx) => rx.await.unwrap_or(Err(abandoned)),
            Entry::Lead(generation, rx) => {
                let operation = op();
                let this = Arc::clone(self);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let result = operation.await;
                            this.complete(generation, result);
                        });
                    }
                    Err(_) => {
                        let result = operation.await;
                        this.complete(generation, result);
                    }
                }
                rx.await.unwrap_or(Err(abandoned))
            }
        }
    }

    fn complete(&self, generation: u64, result: Result<(), E>) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            let next = if result.is_ok() {
                FlightState::Done
            } else {
                FlightState::Idle
            };
            match core::mem::replace(&mut inner.state, next) {
                FlightState::InFlight { waiters } => waiters,
                other => {
                    inner.state = other;
                    return;
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// 回到 `Idle` 并以 `error` 拒绝全部排队者。返回被拒绝的数量。
    pub fn reset(&self, error: E) -> usize {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            match core::mem::replace(&mut inner.state, FlightState::Idle) {
                FlightState::InFlight { waiters } => waiters,
                _ => Vec::new(),
            }
        };
        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn concurrent_callers_share_one_operation() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                flight
                    .run(
                        move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move {
                                gate.notified().await;
                                Ok(())
                            }
                        },
                        "abandoned".to_owned(),
                    )
                    .await
            }));
        }

        while !flight.is_in_flight() {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for task in tasks {
            assert_eq!(task.await.expect("task completes"), Ok(()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_done());
    }

    #[tokio::test]
    async fn done_state_resolves_without_running_again() {
        let flight = Arc::new(SingleFlight::<String>::new());
        flight
            .run(|| async { Ok(()) }, "abandoned".to_owned())
            .await
            .expect("first run succeeds");
        let result = flight
            .run(
                || async { panic!("operation must not run once done") },
                "abandoned".to_owned(),
            )
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn failure_returns_to_idle_so_next_caller_retries() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let first = flight
            .run(|| async { Err("boom".to_owned()) }, "abandoned".to_owned())
            .await;
        assert_eq!(first, Err("boom".to_owned()));
        assert!(!flight.is_done());

        let second = flight
            .run(|| async { Ok(()) }, "abandoned".to_owned())
            .await;
        assert_eq!(second, Ok(()));
    }

    #[tokio::test]
    async fn reset_rejects_waiters_and_ignores_stale_completion() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let gate = Arc::new(Notify::new());

        let waiter = {
            let flight = Arc::clone(&flight);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                flight
                    .run(
                        move || async move {
                            gate.notified().await;
                            Ok(())
                        },
                        "abandoned".to_owned(),
                    )
                    .await
            })
        };

        while !flight.is_in_flight() {
            tokio::task::yield_now().await;
        }
        assert_eq!(flight.reset("reset".to_owned()), 1);
        assert_eq!(waiter.await.expect("task completes"), Err("reset".to_owned()));

        gate.notify_one();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!flight.is_done(), "stale completion must not mark the flight done");
    }
}
