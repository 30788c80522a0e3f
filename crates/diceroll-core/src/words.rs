//! Word list used to render digests as short phrases
//!
//! One byte selects one word, so a phrase of `n` words carries `8 * n` bits.

/// 256 distinct words, indexed by byte value
pub const WORDS: [&str; 256] = [
    "acid", "acorn", "actor", "adobe", "agent", "alarm", "album", "alert",
    "alien", "alpha", "amber", "angle", "apple", "april", "arena", "arrow",
    "aspen", "atlas", "audio", "autumn", "badge", "bagel", "baker", "bamboo",
    "banjo", "baron", "basil", "beach", "beacon", "berry", "bison", "blade",
    "blaze", "bloom", "board", "bonus", "brave", "bread", "brick", "bridge",
    "cabin", "cable", "cactus", "camel", "candle", "canoe", "canyon", "cargo",
    "carpet", "castle", "cedar", "chalk", "charm", "cherry", "chess", "cider",
    "cloud", "clover", "cobra", "comet", "coral", "cotton", "crane", "crown",
    "cycle", "daisy", "dance", "delta", "denim", "desert", "diary", "dingo",
    "disco", "dragon", "drift", "drum", "eagle", "ember", "empire", "engine",
    "epoch", "event", "fable", "falcon", "fancy", "feast", "fern", "fiber",
    "field", "flame", "flint", "flute", "forest", "fossil", "frost", "fudge",
    "galaxy", "garden", "garlic", "gecko", "ghost", "giant", "ginger", "glacier",
    "globe", "grape", "gravel", "guitar", "hammer", "harbor", "harvest", "hazel",
    "helmet", "heron", "honey", "hotel", "humor", "husky", "igloo", "index",
    "indigo", "iris", "island", "ivory", "jacket", "jaguar", "jasmine", "jelly",
    "jewel", "jolly", "judge", "juice", "jungle", "karma", "kayak", "kernel",
    "kettle", "kiwi", "koala", "label", "ladder", "lagoon", "lemon", "lens",
    "lilac", "linen", "lizard", "lobster", "locket", "lotus", "lunar", "magnet",
    "mango", "maple", "marble", "meadow", "melon", "meteor", "mint", "mirror",
    "mocha", "monkey", "mosaic", "motor", "muffin", "nectar", "needle", "noble",
    "noodle", "north", "novel", "nutmeg", "oasis", "ocean", "olive", "omega",
    "onion", "opal", "orbit", "orchid", "otter", "oxygen", "paddle", "panda",
    "paper", "parrot", "pastel", "peach", "pebble", "pepper", "piano", "pilot",
    "pixel", "planet", "plum", "polar", "poppy", "prism", "pulse", "puzzle",
    "quartz", "quill", "quiver", "rabbit", "radar", "radish", "raven", "rocket",
    "rodeo", "ruby", "saddle", "salmon", "satin", "scarf", "shadow", "silver",
    "sketch", "slate", "sonic", "spark", "spice", "spruce", "stone", "sugar",
    "summit", "tango", "temple", "thistle", "thunder", "tiger", "timber", "toast",
    "topaz", "torch", "tulip", "tundra", "turtle", "unity", "urban", "valley",
    "velvet", "violet", "vortex", "walnut", "walrus", "willow", "window", "winter",
    "wizard", "yacht", "yarrow", "yodel", "zebra", "zephyr", "zinc", "zodiac",
];

/// Render the leading `count` bytes of `digest` as space separated words
///
/// `count` is clamped to the digest length.
pub fn to_words(digest: &[u8], count: usize) -> String {
    digest
        .iter()
        .take(count)
        .map(|b| WORDS[*b as usize])
        .collect::<Vec<_>>()
        .join(" ")
}
