use clap::ValueEnum;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    Auto,
    On,
    Off,
}

impl VerifyMode {
    /// Hash to check for an item, or an error message when one is required but absent.
    pub fn expected_hash(self, hash: Option<&str>) -> Result<Option<String>, String> {
        match (self, hash) {
            (VerifyMode::Off, _) => Ok(None),
            (VerifyMode::On, None) => Err("hash verification is on but no hash was given".into()),
            (_, hash) => Ok(hash.map(str::to_string)),
        }
    }
}
