//! Triggers and the channels bound to them.
//!
//! A [`Trigger`] is a strobe emitted once per cycle by the trigger device on one of its
//! outputs, `raise_at` seconds after the cycle starts. AWG channels wired to that output
//! only start playing when the strobe arrives, so a channel can not carry any content
//! before the `raise_at` of its trigger.
//!
//! The [`ChannelRegistry`] owns triggers and channels and hands out opaque
//! [`TriggerId`] / [`ChannelId`] handles; everything else in the crate refers to them by
//! handle. Names are unique per kind and validated with
//! [`validate_name`](crate::utils::validate_name).

use crate::error::{Error, Result};
use crate::utils::validate_name;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(usize);

#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    name: String,
    trigger_channel: usize,
    raise_at: f64,
    drop_after: f64,
    linked_channels: Vec<ChannelId>,
}

impl Trigger {
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Output index on the trigger device.
    pub fn trigger_channel(&self) -> usize {
        self.trigger_channel
    }
    pub fn raise_at(&self) -> f64 {
        self.raise_at
    }
    pub fn drop_after(&self) -> f64 {
        self.drop_after
    }
    pub fn linked_channels(&self) -> &[ChannelId] {
        &self.linked_channels
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    name: String,
    trigger: Option<TriggerId>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn trigger(&self) -> Option<TriggerId> {
        self.trigger
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChannelRegistry {
    triggers: Vec<Trigger>,
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a trigger strobe.
    ///
    /// ```
    /// # use seqcompiler_backend::channel::ChannelRegistry;
    /// let mut registry = ChannelRegistry::new();
    /// let trig = registry.add_trigger("drive_trig", 1, 1e-6, 4e-6).unwrap();
    /// assert_eq!(registry.trigger(trig).unwrap().raise_at(), 1e-6);
    /// assert!(registry.add_trigger("drive_trig", 2, 0., 4e-6).is_err());
    /// ```
    pub fn add_trigger(
        &mut self,
        name: &str,
        trigger_channel: usize,
        raise_at: f64,
        drop_after: f64,
    ) -> Result<TriggerId> {
        validate_name("trigger", name)?;
        if self.trigger_id(name).is_ok() {
            return Err(Error::DuplicateName {
                kind: "trigger",
                name: name.to_string(),
                registered: self.triggers.iter().map(|t| t.name.clone()).collect(),
            });
        }
        self.triggers.push(Trigger {
            name: name.to_string(),
            trigger_channel,
            raise_at,
            drop_after,
            linked_channels: Vec::new(),
        });
        Ok(TriggerId(self.triggers.len() - 1))
    }

    /// Registers a channel not yet bound to any trigger.
    pub fn add_channel(&mut self, name: &str) -> Result<ChannelId> {
        validate_name("channel", name)?;
        if self.channel_id(name).is_ok() {
            return Err(Error::DuplicateName {
                kind: "channel",
                name: name.to_string(),
                registered: self.channels.iter().map(|c| c.name.clone()).collect(),
            });
        }
        self.channels.push(Channel {
            name: name.to_string(),
            trigger: None,
        });
        Ok(ChannelId(self.channels.len() - 1))
    }

    /// Binds `channel` to `trigger`, replacing any previous binding.
    pub fn link(&mut self, channel: ChannelId, trigger: TriggerId) -> Result<()> {
        self.trigger(trigger)?;
        let previous = self.channel(channel)?.trigger;
        if previous == Some(trigger) {
            return Ok(());
        }
        if let Some(TriggerId(old)) = previous {
            self.triggers[old].linked_channels.retain(|c| *c != channel);
        }
        self.triggers[trigger.0].linked_channels.push(channel);
        self.channels[channel.0].trigger = Some(trigger);
        Ok(())
    }

    pub fn trigger(&self, id: TriggerId) -> Result<&Trigger> {
        self.triggers
            .get(id.0)
            .ok_or_else(|| Error::unknown("trigger", format!("#{}", id.0)))
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(id.0)
            .ok_or_else(|| Error::unknown("channel", format!("#{}", id.0)))
    }

    /// Name of a channel, for messages.
    pub fn channel_name(&self, id: ChannelId) -> &str {
        self.channels
            .get(id.0)
            .map_or("<unregistered>", |c| c.name.as_str())
    }

    /// The trigger gating `channel`; an unlinked channel is a usage error.
    pub fn trigger_of(&self, channel: ChannelId) -> Result<&Trigger> {
        match self.channel(channel)?.trigger {
            Some(trigger) => self.trigger(trigger),
            None => Err(Error::UnlinkedChannel {
                channel: self.channel_name(channel).to_string(),
            }),
        }
    }

    pub fn trigger_id(&self, name: &str) -> Result<TriggerId> {
        self.triggers
            .iter()
            .position(|t| t.name == name)
            .map(TriggerId)
            .ok_or_else(|| Error::unknown("trigger", name))
    }

    pub fn channel_id(&self, name: &str) -> Result<ChannelId> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(ChannelId)
            .ok_or_else(|| Error::unknown("channel", name))
    }

    pub fn triggers(&self) -> impl Iterator<Item = (TriggerId, &Trigger)> {
        self.triggers
            .iter()
            .enumerate()
            .map(|(i, t)| (TriggerId(i), t))
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, c)| (ChannelId(i), c))
    }
}
