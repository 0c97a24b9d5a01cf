// Referral ledger: invite → signup → conversion, plus operator repair and rewards.
// All state goes through `store::ReferralStore`; the milestone rule lives in `earnings`.

pub mod codes;
pub mod conversion;
pub mod earnings;
pub mod handlers;
pub mod invite;
pub mod repair;
pub mod rewards;
pub mod signup;
