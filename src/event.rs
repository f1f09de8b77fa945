use crate::power::PowerSignal;

/// Everything producer threads hand to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Event {
    Activity,
    /// Keyboard backlight changed outside of our control (Fn shortcut).
    BacklightChanged(u32),
    Power(PowerSignal),
    Retrigger,
}
