mod discovery_tests;
mod health_tests;
mod resolve_tests;
