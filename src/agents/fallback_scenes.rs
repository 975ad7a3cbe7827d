//! Deterministic scenes used when synthesis cannot produce valid source.
//!
//! Both scenes satisfy the full scene contract: entry import, `Lesson(Scene)`,
//! a `construct` that animates, and the `show_caption` helper.

use crate::pipeline::ModuleSpec;

/// Longest title or bullet rendered on screen.
const MAX_LABEL_CHARS: usize = 60;

/// Most outline bullets the rich scene lays out.
const MAX_BULLETS: usize = 6;

/// Quote `value` as a double-quoted Python string literal.
pub fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn label(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_LABEL_CHARS {
        collapsed
    } else {
        let mut cut: String = collapsed.chars().take(MAX_LABEL_CHARS - 1).collect();
        cut.push('…');
        cut
    }
}

const CAPTION_HELPER: &str = "    def show_caption(self, text, duration=2.0):
        caption = Text(text, font_size=28).to_edge(DOWN)
        self.play(FadeIn(caption))
        self.wait(duration)
        self.play(FadeOut(caption))
";

/// Title card with one caption.
pub fn minimal_scene(module: &ModuleSpec) -> String {
    let title = if module.title.trim().is_empty() {
        "Lesson".to_string()
    } else {
        label(&module.title)
    };

    format!(
        "from manim import *


class Lesson(Scene):
    def construct(self):
        title = Text({title}, font_size=40)
        self.play(Write(title))
        self.show_caption({caption})
        self.play(FadeOut(title))
        self.wait(0.5)

{helper}",
        title = py_str(&title),
        caption = py_str("Let's explore this lesson."),
        helper = CAPTION_HELPER,
    )
}

/// Title, animated outline bullets, a caption and a highlight box.
///
/// `caption` is typically the opening sentence of the lesson text.
pub fn rich_scene(module: &ModuleSpec, caption: Option<&str>) -> String {
    let title = if module.title.trim().is_empty() {
        "Lesson".to_string()
    } else {
        label(&module.title)
    };

    let mut points: Vec<String> = module
        .outline
        .iter()
        .filter(|p| !p.trim().is_empty())
        .take(MAX_BULLETS)
        .map(|p| label(p))
        .collect();
    if points.is_empty() {
        points.push("Key ideas".to_string());
    }

    let point_lines: String = points
        .iter()
        .map(|p| format!("            {},\n", py_str(p)))
        .collect();

    let caption = caption
        .map(label)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| label(&format!("Recap: {}", title)));

    format!(
        "from manim import *


class Lesson(Scene):
    def construct(self):
        title = Text({title}, font_size=40).to_edge(UP)
        self.play(Write(title))
        points = [
{point_lines}        ]
        bullets = VGroup(*[Text(\"• \" + p, font_size=28) for p in points])
        bullets.arrange(DOWN, aligned_edge=LEFT, buff=0.35)
        bullets.next_to(title, DOWN, buff=0.6)
        for bullet in bullets:
            self.play(FadeIn(bullet, shift=RIGHT * 0.3), run_time=0.6)
        self.show_caption({caption})
        box = SurroundingRectangle(bullets, color=BLUE, buff=0.25)
        self.play(Create(box))
        self.wait(1)
        self.play(FadeOut(VGroup(title, bullets, box)))

{helper}",
        title = py_str(&title),
        point_lines = point_lines,
        caption = py_str(&caption),
        helper = CAPTION_HELPER,
    )
}
