use serde::Serialize;

/// Lifecycle state of a job.
///
/// `Invalid` is the state of a freshly allocated job that has not yet been
/// enqueued anywhere.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
    Invalid,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed => "delayed",
            Reserved => "reserved",
            Buried => "buried",
            Invalid => "invalid",
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
