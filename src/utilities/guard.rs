//! RAII guard that runs a function on construction, keeps whatever
//! it returns, and hands it back to a second function when the guard
//! drops out of scope.
//!
//! Useful for save/restore pairs of global hardware state that must
//! be undone no matter the return path.
//!
//! Example
//! ```
//! # use bootgate_lib::utilities::guard::Guard;
//! let mut level = 3u8;
//! {
//!     // The previous level is saved and the level lowered for
//!     // as long as the guard lives.
//!     let _guard = Guard::new(&mut level, |l| core::mem::replace(l, 0), |l, saved| *l = saved);
//! }
//! // Guard has dropped out of scope here, so the level is restored
//! assert_eq!(level, 3);
//! ```

/// Holds exclusive access to an item between an entry and an exit action.
pub struct Guard<'a, T, S, G>
where
    G: FnOnce(&mut T, S),
{
    item: &'a mut T,
    exit: Option<(G, S)>,
}

impl<'a, T, S, G> Guard<'a, T, S, G>
where
    G: FnOnce(&mut T, S),
{
    pub fn new<F: FnOnce(&mut T) -> S>(item: &'a mut T, on_entry: F, on_exit: G) -> Self {
        let saved = on_entry(item);
        Self { item, exit: Some((on_exit, saved)) }
    }
}

impl<'a, T, S, G> Drop for Guard<'a, T, S, G>
where
    G: FnOnce(&mut T, S),
{
    fn drop(&mut self) {
        if let Some((on_exit, saved)) = self.exit.take() {
            on_exit(self.item, saved);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_action_receives_saved_state_on_early_return() {
        fn bail(log: &mut Vec<&'static str>) -> Result<(), ()> {
            let _guard = Guard::new(
                log,
                |log| {
                    log.push("enter");
                    7u32
                },
                |log, saved| {
                    assert_eq!(saved, 7);
                    log.push("exit");
                },
            );
            Err(())
        }

        // Given
        let mut log = Vec::new();

        // When
        assert!(bail(&mut log).is_err());

        // Then
        assert_eq!(log, ["enter", "exit"]);
    }
}
