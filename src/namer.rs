//! Trigger-to-channel name resolution.
//!
//! Subscribers name an abstract trigger; the broker routes on a concrete
//! channel (routing key). A `ChannelNamer` bridges the two. The transform
//! must be pure and deterministic: publishers and subscribers that apply
//! the same transform to the same trigger and options land on the same
//! channel without coordinating further.

use std::sync::Arc;

use serde_json::Value;

/// Per-subscription arguments consumed by the transform.
pub type TriggerOptions = Value;

type TransformFn = dyn Fn(&str, Option<&TriggerOptions>) -> String + Send + Sync;

/// Maps `(trigger, options)` to a broker channel name.
#[derive(Clone)]
pub struct ChannelNamer {
    transform: Arc<TransformFn>,
}

impl ChannelNamer {
    /// Identity transform: the channel is the trigger name unchanged.
    pub fn identity() -> Self {
        Self {
            transform: Arc::new(|trigger, _| trigger.to_string()),
        }
    }

    /// Custom transform supplied by the host application.
    pub fn custom<F>(transform: F) -> Self
    where
        F: Fn(&str, Option<&TriggerOptions>) -> String + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(transform),
        }
    }

    /// Dotted-path transform: appends each string in `options.path` to the
    /// trigger, separated by dots. `("comments", {"path": ["repoA"]})`
    /// resolves to `"comments.repoA"`. Options without a `path` array leave
    /// the trigger unchanged.
    pub fn dotted_path() -> Self {
        Self::custom(|trigger, options| {
            let mut channel = trigger.to_string();
            if let Some(segments) = options
                .and_then(|o| o.get("path"))
                .and_then(Value::as_array)
            {
                for segment in segments.iter().filter_map(Value::as_str) {
                    channel.push('.');
                    channel.push_str(segment);
                }
            }
            channel
        })
    }

    /// Resolve a trigger name to its channel.
    pub fn resolve(&self, trigger: &str, options: Option<&TriggerOptions>) -> String {
        (self.transform)(trigger, options)
    }
}

impl Default for ChannelNamer {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Debug for ChannelNamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelNamer").finish_non_exhaustive()
    }
}
