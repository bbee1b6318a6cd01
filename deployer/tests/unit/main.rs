//! Integration tests driving the orchestrator against in-memory fakes


mod test_config;
mod test_runner;
mod test_selector;
mod test_tail;
