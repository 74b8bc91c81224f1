//! ホストとデバイスの間でメッセージをやり取りするキューのモジュール

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use log::trace;

struct State<T> {
    buf: VecDeque<T>,
    max_size: usize,
    blocking: bool,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// スレッド間で共有できる有界のFIFOキュー
///
/// * blocking の場合、満杯のキューへの `send` は空きができるまで待ちます。
/// * non-blocking の場合、満杯のキューへの `send` は最も古いメッセージを捨てます。
pub struct DataQueue<T> {
    name: String,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DataQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> DataQueue<T> {
    /// 新しいキューを作成します。
    ///
    /// # Args
    /// * `name` - キューの名前 (ログとエラーメッセージに使います)
    /// * `max_size` - 最大のメッセージ数 (0は1として扱います)
    /// * `blocking` - 満杯のときに送信側を待たせるか
    pub fn new(name: &str, max_size: usize, blocking: bool) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: VecDeque::new(),
                    max_size: max_size.max(1),
                    blocking,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<T>>> {
        self.shared
            .state
            .lock()
            .map_err(|_| anyhow!("queue '{}' is poisoned", self.name))
    }

    /// メッセージを送信します。
    pub fn send(&self, msg: T) -> Result<()> {
        let mut st = self.lock()?;
        loop {
            if st.closed {
                bail!("queue '{}' is closed", self.name);
            }
            if st.buf.len() < st.max_size {
                break;
            }
            if !st.blocking {
                while st.buf.len() >= st.max_size {
                    st.buf.pop_front();
                }
                trace!("queue '{}' full, dropped the oldest message", self.name);
                break;
            }
            st = self
                .shared
                .not_full
                .wait(st)
                .map_err(|_| anyhow!("queue '{}' is poisoned", self.name))?;
        }
        st.buf.push_back(msg);
        drop(st);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// メッセージが届くまで待って受信します。
    /// キューが閉じられ、空になった場合はエラーを返します。
    pub fn get(&self) -> Result<T> {
        let mut st = self.lock()?;
        loop {
            if let Some(msg) = st.buf.pop_front() {
                drop(st);
                self.shared.not_full.notify_one();
                return Ok(msg);
            }
            if st.closed {
                bail!("queue '{}' is closed", self.name);
            }
            st = self
                .shared
                .not_empty
                .wait(st)
                .map_err(|_| anyhow!("queue '{}' is poisoned", self.name))?;
        }
    }

    /// 最大 `timeout` だけ待って受信します。
    ///
    /// # Return
    /// * タイムアウトした場合は `None`
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock()?;
        loop {
            if let Some(msg) = st.buf.pop_front() {
                drop(st);
                self.shared.not_full.notify_one();
                return Ok(Some(msg));
            }
            if st.closed {
                bail!("queue '{}' is closed", self.name);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .shared
                .not_empty
                .wait_timeout(st, deadline - now)
                .map_err(|_| anyhow!("queue '{}' is poisoned", self.name))?;
            st = guard;
        }
    }

    /// 待たずに受信します。メッセージがなければ `None` を返します。
    pub fn try_get(&self) -> Result<Option<T>> {
        let mut st = self.lock()?;
        match st.buf.pop_front() {
            Some(msg) => {
                drop(st);
                self.shared.not_full.notify_one();
                Ok(Some(msg))
            }
            None if st.closed => bail!("queue '{}' is closed", self.name),
            None => Ok(None),
        }
    }

    /// 最大メッセージ数を変更します。non-blocking の場合、溢れた古いメッセージは捨てられます。
    pub fn set_max_size(&self, max_size: usize) -> Result<()> {
        let mut st = self.lock()?;
        st.max_size = max_size.max(1);
        if !st.blocking {
            while st.buf.len() > st.max_size {
                st.buf.pop_front();
            }
        }
        drop(st);
        self.shared.not_full.notify_all();
        Ok(())
    }

    /// 満杯のときの動作を変更します。
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.lock()?.blocking = blocking;
        // 待っている送信者に上書きモードへの切り替えを知らせる
        self.shared.not_full.notify_all();
        Ok(())
    }

    pub fn max_size(&self) -> Result<usize> {
        Ok(self.lock()?.max_size)
    }

    pub fn is_blocking(&self) -> Result<bool> {
        Ok(self.lock()?.blocking)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.buf.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.buf.is_empty())
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.lock()?.closed)
    }

    /// キューを閉じ、待っているすべてのスレッドを起こします。
    /// 残っているメッセージは受信できます。
    pub fn close(&self) {
        if let Ok(mut st) = self.shared.state.lock() {
            st.closed = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = DataQueue::new("q", 4, true);
        for i in 0..3 {
            q.send(i).unwrap();
        }
        assert_eq!(q.get().unwrap(), 0);
        assert_eq!(q.try_get().unwrap(), Some(1));
        assert_eq!(q.get_timeout(Duration::from_millis(1)).unwrap(), Some(2));
        assert_eq!(q.try_get().unwrap(), None);
    }

    #[test]
    fn non_blocking_overwrites_oldest() {
        let q = DataQueue::new("nn", 4, false);
        for i in 0..10 {
            q.send(i).unwrap();
        }
        assert_eq!(q.len().unwrap(), 4);
        let got: Vec<i32> = std::iter::from_fn(|| q.try_get().unwrap()).collect();
        assert_eq!(got, vec![6, 7, 8, 9]);
    }

    #[test]
    fn shrinking_non_blocking_queue_drops_oldest() {
        let q = DataQueue::new("nn", 8, false);
        for i in 0..6 {
            q.send(i).unwrap();
        }
        q.set_max_size(2).unwrap();
        assert_eq!(q.try_get().unwrap(), Some(4));
        assert_eq!(q.try_get().unwrap(), Some(5));
    }

    #[test]
    fn blocking_send_waits_for_room() {
        let q = DataQueue::new("in", 1, true);
        q.send(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.send(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len().unwrap(), 1);

        assert_eq!(q.get().unwrap(), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(q.get().unwrap(), 2);
    }

    #[test]
    fn switching_to_non_blocking_releases_waiting_sender() {
        let q = DataQueue::new("in", 1, true);
        q.send(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.send(2))
        };
        thread::sleep(Duration::from_millis(20));
        q.set_blocking(false).unwrap();
        producer.join().unwrap().unwrap();
        assert_eq!(q.try_get().unwrap(), Some(2));
    }

    #[test]
    fn close_wakes_receivers_and_rejects_senders() {
        let q: DataQueue<u8> = DataQueue::new("out", 2, true);
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.get())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(consumer.join().unwrap().is_err());
        assert!(q.send(1).is_err());
        assert!(q.try_get().is_err());
        assert!(q.is_closed().unwrap());
    }

    #[test]
    fn closed_queue_still_drains() {
        let q = DataQueue::new("out", 2, true);
        q.send(5).unwrap();
        q.close();
        assert_eq!(q.get().unwrap(), 5);
        assert!(q.get().is_err());
    }

    #[test]
    fn get_timeout_expires() {
        let q: DataQueue<u8> = DataQueue::new("out", 2, true);
        assert_eq!(q.get_timeout(Duration::from_millis(10)).unwrap(), None);
    }
}
