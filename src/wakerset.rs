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
/// of driving the batch (its window, then its fetch) to completion, but other
/// tasks can take its place if that one is dropped.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a running future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular task.
///
/// The WakerSet maintains the notion of the "driving waker"; this is the
/// waker that most recently polled the shared batch. If the driving waker is
/// discarded from the set, another is selected and woken, so the batch always
/// has a path forward as long as somebody is still waiting on it.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. WakerSets live for one batch, so
    // there's no chance of running out of these.
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
    /// Add a new waker to this set, or replace the waker stored under an
    /// existing token, and make it the driving waker. Returns the token to
    /// use on the next poll.
    pub(crate) fn upsert_waker(&mut self, token: Option<Token>, waker: &Waker) -> Token {
        match token {
            Some(token) if self.wakers.contains_key(&token) => {
                self.replace_waker(&token, waker);
                token
            }
            _ => self.add_waker(waker.clone()),
        }
    }

    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set.
    ///
    /// This waker is set as the current driving waker, on the assumption that
    /// it has just been used to poll the batch.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        self.driving_waker = Some(token.duplicate());
        token
    }

    /// Set a waker with an existing token in this set. The waker is passed by
    /// reference and is set with clone_from because it comes from a Context
    /// and will need to be cloned anyway.
    fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        if let Some(existing) = self.wakers.get_mut(token) {
            existing.clone_from(waker);
            self.driving_waker = Some(token.duplicate());
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// We create a new driving waker immediately because if a series of drops
    /// happen at the same time we need to ensure that at least one non-dropped
    /// waker is awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake the driving waker, if there is one. Used when a batch is closed
    /// from outside of a poll (because it filled up), so that it's dispatched
    /// without waiting for its window.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    /// Wake every waker except the one associated with `token`, which is
    /// about to collect its result anyway.
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
