// Test modules for natpmp
// Each module covers the corresponding source file; client_tests drives the
// whole client against an in-memory gateway.

mod gateway_tests;
mod manager_tests;
mod support;
