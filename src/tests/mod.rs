// Test modules for PortBridge
// One module per source area; network fixtures live in support

mod support;

mod config_tests;
mod net_tests;
mod public_ip_tests;
