use std::collections::VecDeque;

/// An item waiting for another attempt.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    pub item: T,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// Why an item was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The item used up its retries.
    Exhausted,
    /// The queue holds `max_pending` items already.
    Full,
}

impl Rejected {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Full => "full",
        }
    }
}

/// Bounded FIFO of items whose name exchange is not ready yet.
#[derive(Debug)]
pub struct RetryQueue<T> {
    max_retries: u32,
    max_pending: usize,
    items: VecDeque<Pending<T>>,
}

impl<T> RetryQueue<T> {
    pub fn new(max_retries: u32, max_pending: usize) -> Self {
        Self {
            max_retries,
            max_pending,
            items: VecDeque::new(),
        }
    }

    /// Queues `item` after its `attempts`-th failure.
    pub fn push(&mut self, item: T, attempts: u32) -> Result<(), (T, Rejected)> {
        if attempts > self.max_retries {
            return Err((item, Rejected::Exhausted));
        }
        if self.items.len() >= self.max_pending {
            return Err((item, Rejected::Full));
        }
        self.items.push_back(Pending { item, attempts });
        Ok(())
    }

    /// Removes every queued item, oldest first.
    pub fn take_all(&mut self) -> Vec<Pending<T>> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
