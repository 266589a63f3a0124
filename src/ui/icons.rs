//! Shared status glyphs with plain-text fallbacks for dumb terminals.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "* ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!] ");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY] ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP] ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP] ");
