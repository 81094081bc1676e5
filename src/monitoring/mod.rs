/*!
 * Monitoring
 * Tracing setup for the allocator and its tools
 */

mod tracer;

pub use tracer::{init_tracing, span_report, ReportSpan};
