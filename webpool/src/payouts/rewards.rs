//! Block reward schedule.
//!
//! Rewards follow a 249/250 geometric disinflation over 100,000-block eras,
//! with a fixed-value band over eras 36–44, a linear descent toward it over
//! eras 33–35, and a 475-era skip once era 45 is reached. All arithmetic is
//! arbitrary-precision integers; these functions are pure and referentially
//! transparent.

use num_bigint::BigInt;

/// Blocks per reward era.
pub const ERA_LENGTH: u64 = 100_000;

const DISINFLATION_RATE_QUOTIENT: u32 = 249;
const DISINFLATION_RATE_DIVISOR: u32 = 250;

/// Fixed rewards for eras 36 through 44, in units of 10^16 wei.
const TAIL_BAND: [u32; 9] = [2000, 1300, 1200, 1100, 1000, 900, 800, 700, 625];

fn max_block_reward() -> BigInt {
    // 50 coins.
    BigInt::from(50u8) * BigInt::from(10u8).pow(18)
}

/// Zero-indexed era of a block height.
pub fn block_era(height: u64) -> u64 {
    if height == 0 {
        return 0;
    }
    (height - 1) / ERA_LENGTH
}

/// Winner reward for an era, in wei.
pub fn winner_reward_by_era(era: u64) -> BigInt {
    if era == 0 {
        return max_block_reward();
    }

    // Skip 475 eras once the tail band ends; the curve continues from a far
    // deeper point of the disinflation schedule.
    let exponent = if era >= 45 { era + 475 } else { era } as u32;

    let q = BigInt::from(DISINFLATION_RATE_QUOTIENT).pow(exponent);
    let d = BigInt::from(DISINFLATION_RATE_DIVISOR).pow(exponent);
    let mut reward = max_block_reward() * q / d;

    if (36..45).contains(&era) {
        reward = BigInt::from(TAIL_BAND[(era - 36) as usize]) * BigInt::from(10u8).pow(16);
    } else if (33..36).contains(&era) {
        // Linear descent from the era-32 reward toward the fixed band:
        // r = r32 - r32 / (2 * (45 - 33)) * (era - 33 + 1)
        let base = winner_reward_by_era(32);
        let step = &base / BigInt::from(2 * (45 - 33)) * BigInt::from(era - 33 + 1);
        reward = base - step;
    }

    reward
}

/// Uncle reward: 1/32nd of the era's winner reward, floored.
pub fn uncle_reward_by_era(era: u64) -> BigInt {
    winner_reward_by_era(era) / BigInt::from(32u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    fn wei(s: &str) -> BigInt {
        s.parse().unwrap()
    }

    #[test]
    fn era_boundaries() {
        assert_eq!(block_era(0), 0);
        assert_eq!(block_era(1), 0);
        assert_eq!(block_era(100_000), 0);
        assert_eq!(block_era(100_001), 1);
        assert_eq!(block_era(200_000), 1);
        assert_eq!(block_era(200_001), 2);
        assert_eq!(block_era(3_300_001), 33);
    }

    #[test]
    fn era_zero_winner_and_uncle() {
        assert_eq!(winner_reward_by_era(0), wei("50000000000000000000"));
        assert_eq!(uncle_reward_by_era(0), wei("1562500000000000000"));
    }

    #[test]
    fn geometric_curve_in_early_eras() {
        // Era 1: 50e18 * 249 / 250.
        assert_eq!(winner_reward_by_era(1), wei("49800000000000000000"));
        // Era 2: 50e18 * 249^2 / 250^2.
        let expected = (BigInt::from(50u8) * BigInt::from(10u8).pow(18)
            * BigInt::from(249u8).pow(2))
            / BigInt::from(250u8).pow(2);
        assert_eq!(winner_reward_by_era(2), expected);
    }

    #[test]
    fn rewards_decrease_monotonically_before_the_band() {
        let mut previous = winner_reward_by_era(0);
        for era in 1..33 {
            let reward = winner_reward_by_era(era);
            assert!(reward < previous, "era {era} did not decrease");
            assert!(reward > BigInt::zero());
            previous = reward;
        }
    }

    #[test]
    fn fixed_band_overrides_the_curve() {
        assert_eq!(winner_reward_by_era(36), wei("20000000000000000000"));
        assert_eq!(winner_reward_by_era(37), wei("13000000000000000000"));
        assert_eq!(winner_reward_by_era(44), wei("6250000000000000000"));
    }

    #[test]
    fn linear_descent_band() {
        let base = winner_reward_by_era(32);
        for era in 33..36 {
            let step = &base / BigInt::from(24) * BigInt::from(era - 32);
            assert_eq!(winner_reward_by_era(era), &base - step);
        }
    }

    #[test]
    fn era_skip_after_the_tail() {
        // Era 45 evaluates the curve at exponent 520.
        let expected = (max_block_reward() * BigInt::from(249u8).pow(520))
            / BigInt::from(250u8).pow(520);
        assert_eq!(winner_reward_by_era(45), expected);
        // Deep in the tail the reward keeps shrinking but stays positive.
        assert!(winner_reward_by_era(46) < winner_reward_by_era(45));
        assert!(winner_reward_by_era(100) > BigInt::zero());
    }

    #[test]
    fn uncle_law() {
        for era in [0u64, 1, 5, 32, 33, 37, 45, 80] {
            let winner = winner_reward_by_era(era);
            let uncle = uncle_reward_by_era(era);
            let scaled = &uncle * BigInt::from(32u8);
            assert!(scaled <= winner);
            assert!(winner < scaled + BigInt::from(32u8));
        }
    }
}
