/// Line voltage of the simulated supply, in volts.
pub const LINE_VOLTAGE: u64 = 230;

/// Return the active power drawn by a station.
///
/// The power follows the operator setpoint, not the sampled current, and is
/// zero whenever the station is not charging.
/// Computed in `u64`, so any `u32` setpoint is representable.
pub fn active_power_watts(setpoint_amps: u32, charging: bool) -> u64 {
    if charging {
        u64::from(setpoint_amps) * LINE_VOLTAGE
    } else {
        0
    }
}
