//! Voice-agent providers. Each one turns a provider connection into an `AgentStream`.

pub mod deepgram;
