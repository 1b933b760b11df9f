//! Shared UI icons with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PHASE: Emoji<'_, '_> = Emoji("🌊 ", "[P]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
pub static SAVE: Emoji<'_, '_> = Emoji("💾 ", "[CKPT]");
