use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// The event loop consumes ticks and turns them into [`TickerEvents`]. This way
/// we decouple policies from the loop itself.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Look for the next task in the global injector first.
        const POP_GLOBAL_QUEUE = 1;

        /// A request to shut down the runtime.
        const SHUTDOWN = 1 << 1;
    }
}
