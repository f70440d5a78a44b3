//! The streaming conversation engine: turn driving, playback sequencing,
//! utterance capture, and hands-free turn-taking coordination.

pub mod capture;
pub mod coordinator;
pub mod messages;
pub mod sequencer;
