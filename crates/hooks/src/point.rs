use serde::{Deserialize, Serialize};

/// Every place in the pipeline a strategy can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    AssetNormalizeBefore,
    AssetNormalizeAfter,
    RawAssemblyBefore,
    /// Fired once per item about to be inserted into the raw stage
    RawAssemblyInsert,
    RawAssemblyAfter,
    PostprocessUserBefore,
    PostprocessUserAfter,
    PostprocessModelBefore,
    PostprocessModelAfter,
    VariablesSaveBefore,
    VariablesSaveAfter,
    LlmCallBefore,
    LlmCallAfter,
    StreamChunkBefore,
    StreamChunkAfter,
    SaveResponseBefore,
    SaveResponseAfter,
}

impl HookPoint {
    pub const ALL: [HookPoint; 17] = [
        HookPoint::AssetNormalizeBefore,
        HookPoint::AssetNormalizeAfter,
        HookPoint::RawAssemblyBefore,
        HookPoint::RawAssemblyInsert,
        HookPoint::RawAssemblyAfter,
        HookPoint::PostprocessUserBefore,
        HookPoint::PostprocessUserAfter,
        HookPoint::PostprocessModelBefore,
        HookPoint::PostprocessModelAfter,
        HookPoint::VariablesSaveBefore,
        HookPoint::VariablesSaveAfter,
        HookPoint::LlmCallBefore,
        HookPoint::LlmCallAfter,
        HookPoint::StreamChunkBefore,
        HookPoint::StreamChunkAfter,
        HookPoint::SaveResponseBefore,
        HookPoint::SaveResponseAfter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::AssetNormalizeBefore => "asset_normalize_before",
            HookPoint::AssetNormalizeAfter => "asset_normalize_after",
            HookPoint::RawAssemblyBefore => "raw_assembly_before",
            HookPoint::RawAssemblyInsert => "raw_assembly_insert",
            HookPoint::RawAssemblyAfter => "raw_assembly_after",
            HookPoint::PostprocessUserBefore => "postprocess_user_before",
            HookPoint::PostprocessUserAfter => "postprocess_user_after",
            HookPoint::PostprocessModelBefore => "postprocess_model_before",
            HookPoint::PostprocessModelAfter => "postprocess_model_after",
            HookPoint::VariablesSaveBefore => "variables_save_before",
            HookPoint::VariablesSaveAfter => "variables_save_after",
            HookPoint::LlmCallBefore => "llm_call_before",
            HookPoint::LlmCallAfter => "llm_call_after",
            HookPoint::StreamChunkBefore => "stream_chunk_before",
            HookPoint::StreamChunkAfter => "stream_chunk_after",
            HookPoint::SaveResponseBefore => "save_response_before",
            HookPoint::SaveResponseAfter => "save_response_after",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookPoint {
    type Err = crate::HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| crate::HookError::UnknownPoint(s.to_string()))
    }
}
