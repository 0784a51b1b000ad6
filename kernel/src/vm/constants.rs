pub const PAGE_SIZE: u64 = 4096;
pub const SECTOR_SIZE: u64 = 512;
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE / SECTOR_SIZE;

/// See the x86-64 psABI figure 3.9: the initial process stack lives just
/// below the top of the canonical lower half.
pub const USER_STACK_TOP: u64 = 0x7fff_ffff_0000;

/// Pintos caps automatic stack growth at 1MiB.
pub const MAX_STACK_BYTES: u64 = 1024 * 1024;

/// Slack below the current RSP a faulting write is still allowed to touch
/// (covers the red zone and PUSHA-style bulk pushes).
pub const RSP_SLACK_BYTES: u64 = 8;

/// Highest fd a process may allocate; keeps `UserProcess::files` bounded.
pub const FD_MAX: u32 = 128;
