//! Scenario tests: workflows run against a scripted step runner

mod helpers;

mod concurrency;
mod dag_gating;
mod dispatch;
mod guards;
mod matrix;
mod timeouts;
