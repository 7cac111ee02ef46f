use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared batch. Only a single task needs to actually do the work
/// of driving the batch (its window, then its batch function), but other
/// tasks can take its place if that one is dropped.
///
/// Wakers are added to the set in exchange for a token. The token is held by
/// a `BatchFuture` and is used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the set.
///
/// The first waker added to an empty set becomes the "driving waker", and it
/// stays the driver until it is discarded. Every later waker is a passenger:
/// passengers are only awoken when the batch completes, or when the driver
/// is discarded and one of them is promoted. A passenger that is polled
/// again may still advance the batch itself; see `BatchFuture`.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set, and return the token associated with it.
    /// If there is no driving waker, this waker becomes the driver.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .checked_add(1)
            .expect("Overflow when creating token");

        self.wakers.insert(token.duplicate(), waker);
        if self.driving_waker.is_none() {
            self.driving_waker = Some(token.duplicate());
        }
        token
    }

    /// Update the waker for an existing token. A token that is no longer in
    /// the set (because it was moved to a new set when the batch changed
    /// state) is re-added. If there is no driving waker, this one becomes
    /// the driver.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    existing.clone_from(waker);
                }
            }
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }

        if self.driving_waker.is_none() {
            self.driving_waker = Some(token.duplicate());
        }
    }

    pub(crate) fn is_driver(&self, token: &Token) -> bool {
        self.driving_waker.as_ref() == Some(token)
    }

    /// Wake the driving waker, if any. Used when a batch becomes ready to
    /// dispatch without its window elapsing (the key limit was reached).
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker, an arbitrary remaining waker is promoted to driver and awoken,
    /// so that the shared batch always has a path forward.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake every waker except the one associated with `token` (the future
    /// that completed the batch and is about to read its own result).
    pub(crate) fn discard_wake_all(mut self, token: Token) {
        self.wakers.remove(&token);
        self.wake_all();
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
