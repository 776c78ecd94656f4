use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status strings are stored as TEXT; these enums are the typed view.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => anyhow::bail!("unknown {}: {}", stringify!($name), other),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(RoutingStrategy {
    PlanFirst => "plan_first",
    BedrockOnly => "bedrock_only",
});

text_enum!(UserStatus {
    Active => "active",
    Inactive => "inactive",
    Deleted => "deleted",
});

text_enum!(KeyStatus {
    Active => "active",
    Rotating => "rotating",
    Revoked => "revoked",
});

text_enum!(Provider {
    Plan => "plan",
    Bedrock => "bedrock",
});

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::PlanFirst
    }
}
