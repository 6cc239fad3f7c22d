mod debounce;
mod discard;
mod pending;
mod rebase;
mod registration;
mod relocation;
mod rescan;
mod subscribers;
