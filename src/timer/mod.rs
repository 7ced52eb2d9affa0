//! Timer dispatcher.
//!
//! Timers do not run their callbacks where they expire: expiry tasks push a
//! [`TimerFire`] onto the dispatcher channel, and the owner loop executes
//! it on its own task. A stopped timer never fires its callback, even when
//! the expiry is already queued.

mod cron;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;

pub use cron::CronExpr;

use crate::trace::{log_panic, panic_message};

/// A fired timer travelling to its owner loop.
pub struct TimerFire<T> {
    stopped: Arc<AtomicBool>,
    cb: Box<dyn FnOnce(&mut T) + Send>,
}

impl<T> TimerFire<T> {
    /// Run the callback unless the timer was stopped meanwhile. Panics are
    /// contained.
    pub fn fire(self, owner: &mut T, stack_buf_len: usize) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let cb = self.cb;
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(owner)));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            log_panic("timer callback", &msg, stack_buf_len);
        }
    }
}

/// Handle to a scheduled timer or cron job.
pub struct TimerHandle {
    stopped: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. The callback will not run, queued or not.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Producer side of a timer channel; owned by one event loop's context.
pub struct Dispatcher<T> {
    tx: mpsc::Sender<TimerFire<T>>,
}

/// Create a dispatcher and its fire receiver. The receiver must be polled
/// by the owner loop.
pub fn dispatcher<T: Send + 'static>(
    capacity: usize,
) -> (Dispatcher<T>, mpsc::Receiver<TimerFire<T>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Dispatcher { tx }, rx)
}

impl<T: Send + 'static> Dispatcher<T> {
    /// One-shot timer: run `cb` on the owner loop after `d`.
    pub fn after<F>(&self, d: Duration, cb: F) -> TimerHandle
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(d).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            let _ = tx
                .send(TimerFire {
                    stopped: flag,
                    cb: Box::new(cb),
                })
                .await;
        });
        TimerHandle { stopped, task }
    }

    /// Recurring timer driven by a cron expression, evaluated in local
    /// time. Ends when the expression has no next match.
    pub fn cron<F>(&self, expr: CronExpr, cb: F) -> TimerHandle
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let tx = self.tx.clone();
        let cb = Arc::new(cb);
        let task = tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = expr.next(now) else {
                    return;
                };
                let delta = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delta).await;
                if flag.load(Ordering::Acquire) {
                    return;
                }
                let cb = cb.clone();
                let fire = TimerFire {
                    stopped: flag.clone(),
                    cb: Box::new(move |owner: &mut T| cb(owner)),
                };
                if tx.send(fire).await.is_err() {
                    return;
                }
            }
        });
        TimerHandle { stopped, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_after_fires_on_owner_loop() {
        let (disp, mut rx) = dispatcher::<Vec<i32>>(8);
        let mut owner = Vec::new();

        disp.after(Duration::from_millis(10), |owner: &mut Vec<i32>| {
            owner.push(1);
        });

        let fire = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        fire.fire(&mut owner, 0);
        assert_eq!(owner, vec![1]);
    }

    #[tokio::test]
    async fn test_stop_before_expiry() {
        let (disp, mut rx) = dispatcher::<Vec<i32>>(8);

        let handle = disp.after(Duration::from_millis(50), |owner: &mut Vec<i32>| {
            owner.push(1);
        });
        handle.stop();

        let fired = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(fired.is_err(), "stopped timer must not fire");
    }

    #[tokio::test]
    async fn test_stop_after_queued_suppresses_callback() {
        let (disp, mut rx) = dispatcher::<Vec<i32>>(8);
        let mut owner = Vec::new();

        let handle = disp.after(Duration::from_millis(5), |owner: &mut Vec<i32>| {
            owner.push(1);
        });

        let fire = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // The expiry is queued; stopping now still suppresses it.
        handle.stop();
        fire.fire(&mut owner, 0);
        assert!(owner.is_empty());
    }

    #[tokio::test]
    async fn test_callback_panic_contained() {
        let (disp, mut rx) = dispatcher::<Vec<i32>>(8);
        let mut owner = Vec::new();

        disp.after(Duration::from_millis(5), |_: &mut Vec<i32>| {
            panic!("timer boom");
        });

        let fire = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        fire.fire(&mut owner, 256);
        // Still alive to process the next fire.
        disp.after(Duration::from_millis(5), |owner: &mut Vec<i32>| {
            owner.push(2);
        });
        let fire = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        fire.fire(&mut owner, 256);
        assert_eq!(owner, vec![2]);
    }

    #[tokio::test]
    async fn test_cron_fires_repeatedly() {
        let (disp, mut rx) = dispatcher::<Vec<i32>>(8);
        let mut owner = Vec::new();

        let expr = CronExpr::parse("* * * * * *").unwrap();
        let handle = disp.cron(expr, |owner: &mut Vec<i32>| owner.push(0));

        for _ in 0..2 {
            let fire = timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            fire.fire(&mut owner, 0);
        }
        assert_eq!(owner, vec![0, 0]);
        handle.stop();
    }
}
