/// Matches simulator-style `+name=value` and `+name` arguments.
pub struct PlusArgMatcher {
  plusargs: Vec<String>,
}

impl PlusArgMatcher {
  pub fn from_args() -> Self {
    Self::from_list(std::env::args())
  }

  pub fn from_list(args: impl IntoIterator<Item = String>) -> Self {
    let plusargs = args.into_iter().filter(|arg| arg.starts_with('+')).collect();
    Self { plusargs }
  }

  /// Value of `+name=value`, `""` for a bare `+name`. The last occurrence wins.
  pub fn try_match(&self, name: &str) -> Option<&str> {
    self.plusargs.iter().rev().find_map(|arg| {
      let rest = arg.strip_prefix('+')?.strip_prefix(name)?;
      match rest {
        "" => Some(""),
        _ => rest.strip_prefix('='),
      }
    })
  }

  pub fn match_(&self, name: &str) -> anyhow::Result<&str> {
    self.try_match(name).ok_or_else(|| anyhow::anyhow!("required plusarg '+{name}=' not found"))
  }

  pub fn try_parse<T>(&self, name: &str) -> anyhow::Result<Option<T>>
  where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
  {
    self
      .try_match(name)
      .map(|value| value.parse().map_err(|e| anyhow::anyhow!("plusarg '+{name}={value}': {e}")))
      .transpose()
  }

  /// `+name`, `+name=1|true|on` and `+name=0|false|off`; `default` when absent.
  pub fn flag(&self, name: &str, default: bool) -> anyhow::Result<bool> {
    match self.try_match(name) {
      None => Ok(default),
      Some("" | "1" | "true" | "on") => Ok(true),
      Some("0" | "false" | "off") => Ok(false),
      Some(other) => anyhow::bail!("plusarg '+{name}={other}' is not a boolean"),
    }
  }
}
