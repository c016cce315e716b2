mod common;
mod pool_tests;
mod resilience_tests;
mod scheduling_tests;
mod shutdown_tests;
