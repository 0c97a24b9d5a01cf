pub mod billing;
pub mod referral;
pub mod user;
