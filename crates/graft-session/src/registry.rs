use std::collections::hash_map::Entry;
use std::collections::HashMap;

use graft_frame::USER_CHANNEL_START;

use crate::channel::{Channel, ChannelKey};
use crate::error::{Result, SessionError};

/// Per-session table of live channels.
///
/// Locally allocated IDs come from a counter that only moves forward; an ID
/// is never handed out twice, even after its channel is gone.
#[derive(Debug)]
pub(crate) struct Registry {
    channels: HashMap<ChannelKey, Channel>,
    next: Option<u32>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_start(USER_CHANNEL_START)
    }
}

impl Registry {
    pub(crate) fn with_start(start: u32) -> Self {
        Self {
            channels: HashMap::new(),
            next: Some(start),
        }
    }

    /// Reserve a fresh local ID.
    pub(crate) fn allocate(&mut self) -> Result<u32> {
        let id = self.next.ok_or(SessionError::ChannelIdsExhausted)?;
        self.next = id.checked_add(1);
        Ok(id)
    }

    pub(crate) fn insert(&mut self, channel: Channel) {
        self.channels.insert(channel.key(), channel);
    }

    /// Return the channel for `key`, creating it with `make` if absent.
    /// The flag is true when the channel was created by this call.
    pub(crate) fn register_with(
        &mut self,
        key: ChannelKey,
        make: impl FnOnce() -> Channel,
    ) -> (Channel, bool) {
        match self.channels.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(make()).clone(), true),
        }
    }

    pub(crate) fn get(&self, key: ChannelKey) -> Option<Channel> {
        self.channels.get(&key).cloned()
    }

    /// Look up the channel an inbound frame is addressed to.
    pub(crate) fn route(&self, key: ChannelKey) -> Result<Channel> {
        self.get(key).ok_or(SessionError::UnknownChannel(key.id))
    }

    pub(crate) fn remove(&mut self, key: ChannelKey) -> Option<Channel> {
        self.channels.remove(&key)
    }

    pub(crate) fn drain(&mut self) -> Vec<Channel> {
        self.channels.drain().map(|(_, channel)| channel).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}
