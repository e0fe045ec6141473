//! Machine-stable error taxonomy shared by every engine component.
//!
//! `EngineError` is the single error type returned from fallible engine
//! operations. Each variant maps 1:1 onto an `error_code` string that
//! clients key their UI/retry behavior on; `code()` and `retryable()` expose
//! that mapping without forcing callers to match on the enum itself.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("game not found: {0}")]
    GameNotFound(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("target out of range: {0}")]
    TargetOutOfRange(String),
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error("item on cooldown: {0}")]
    ItemOnCooldown(String),
    #[error("item has no charges: {0}")]
    ItemNoCharges(String),
    #[error("invalid equip slot: {0}")]
    InvalidEquipSlot(String),
    #[error("equip requirement not met: {0}")]
    EquipRequirementNotMet(String),
    #[error("quest item locked: {0}")]
    QuestItemLocked(String),
    #[error("undo token missing: {0}")]
    UndoTokenMissing(String),
    #[error("undo token invalid: {0}")]
    UndoTokenInvalid(String),
    #[error("undo expired: {0}")]
    UndoExpired(String),
    #[error("action blocked by status: {0}")]
    ActionBlockedByStatus(String),
    #[error("spell resource update failed: {0}")]
    SpellResourceUpdateFailed(String),
    #[error("rest resource update failed: {0}")]
    RestResourceUpdateFailed(String),
    #[error("item effect failed: {0}")]
    ItemEffectFailed(String),
    #[error("item use exception: {0}")]
    ItemUseException(String),
    #[error("item drop exception: {0}")]
    ItemDropException(String),
    #[error("combat auto-degrade: {0}")]
    CombatAutoDegrade(String),
    #[error("map updates contract type error: {0}")]
    MapUpdatesContractTypeError(String),
    #[error("map updates contract unauthorized field: {0}")]
    MapUpdatesContractUnauthorizedField(String),
    #[error("patch batch type error: {0}")]
    PatchBatchTypeError(String),
    #[error("patch batch field error: {0}")]
    PatchBatchFieldError(String),
    #[error("patch batch dependency error: {0}")]
    PatchBatchDependencyError(String),
    #[error("patch post-check failed: {0}")]
    PatchPostCheckFailed(String),
    #[error("local provider failed: {0}")]
    LocalProviderFailed(String),
    #[error("map generation failed: {0}")]
    MapGenerationFailed(String),
    #[error("action process error: {0}")]
    ActionProcessError(String),
    #[error("choice context not found: {0}")]
    ChoiceContextNotFound(String),
    #[error("save not found: {0}")]
    SaveNotFound(String),
    #[error("save io failed: {0}")]
    SaveIoFailed(String),
    #[error("save data invalid: {0}")]
    SaveDataInvalid(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::GameNotFound(_) => "GAME_NOT_FOUND",
            EngineError::UnknownAction(_) => "UNKNOWN_ACTION",
            EngineError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            EngineError::TargetOutOfRange(_) => "TARGET_OUT_OF_RANGE",
            EngineError::ItemNotFound(_) => "ITEM_NOT_FOUND",
            EngineError::ItemOnCooldown(_) => "ITEM_ON_COOLDOWN",
            EngineError::ItemNoCharges(_) => "ITEM_NO_CHARGES",
            EngineError::InvalidEquipSlot(_) => "INVALID_EQUIP_SLOT",
            EngineError::EquipRequirementNotMet(_) => "EQUIP_REQUIREMENT_NOT_MET",
            EngineError::QuestItemLocked(_) => "QUEST_ITEM_LOCKED",
            EngineError::UndoTokenMissing(_) => "UNDO_TOKEN_MISSING",
            EngineError::UndoTokenInvalid(_) => "UNDO_TOKEN_INVALID",
            EngineError::UndoExpired(_) => "UNDO_EXPIRED",
            EngineError::ActionBlockedByStatus(_) => "ACTION_BLOCKED_BY_STATUS",
            EngineError::SpellResourceUpdateFailed(_) => "SPELL_RESOURCE_UPDATE_FAILED",
            EngineError::RestResourceUpdateFailed(_) => "REST_RESOURCE_UPDATE_FAILED",
            EngineError::ItemEffectFailed(_) => "ITEM_EFFECT_FAILED",
            EngineError::ItemUseException(_) => "ITEM_USE_EXCEPTION",
            EngineError::ItemDropException(_) => "ITEM_DROP_EXCEPTION",
            EngineError::CombatAutoDegrade(_) => "COMBAT_AUTO_DEGRADE",
            EngineError::MapUpdatesContractTypeError(_) => "MAP_UPDATES_CONTRACT_TYPE_ERROR",
            EngineError::MapUpdatesContractUnauthorizedField(_) => {
                "MAP_UPDATES_CONTRACT_UNAUTHORIZED_FIELD"
            }
            EngineError::PatchBatchTypeError(_) => "PATCH_BATCH_TYPE_ERROR",
            EngineError::PatchBatchFieldError(_) => "PATCH_BATCH_FIELD_ERROR",
            EngineError::PatchBatchDependencyError(_) => "PATCH_BATCH_DEPENDENCY_ERROR",
            EngineError::PatchPostCheckFailed(_) => "PATCH_POST_CHECK_FAILED",
            EngineError::LocalProviderFailed(_) => "LOCAL_PROVIDER_FAILED",
            EngineError::MapGenerationFailed(_) => "MAP_GENERATION_FAILED",
            EngineError::ActionProcessError(_) => "ACTION_PROCESS_ERROR",
            EngineError::ChoiceContextNotFound(_) => "CHOICE_CONTEXT_NOT_FOUND",
            EngineError::SaveNotFound(_) => "SAVE_NOT_FOUND",
            EngineError::SaveIoFailed(_) => "SAVE_IO_FAILED",
            EngineError::SaveDataInvalid(_) => "SAVE_DATA_INVALID",
        }
    }

    /// Whether a client may safely retry the action that produced this
    /// error with the same `idempotency_key`.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ItemEffectFailed(_)
                | EngineError::ItemUseException(_)
                | EngineError::ItemDropException(_)
                | EngineError::ActionProcessError(_)
                | EngineError::SaveIoFailed(_)
        )
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}
