/// Wrap rendered report content in a complete HTML document.
pub fn render_page(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} — Verification Coach</title>
<style>
*{{margin:0;padding:0;box-sizing:border-box;}}
body{{font-family:-apple-system,BlinkMacSystemFont,"Segoe UI",Roboto,sans-serif;color:#1a1a1a;background:#fafafa;}}
.container{{max-width:960px;margin:0 auto;padding:24px;}}
.consensus-header{{background:#fff;border:1px solid #e0e0e0;border-radius:8px;padding:16px;margin-bottom:12px;}}
.consensus-header h2{{font-size:18px;text-transform:uppercase;margin-bottom:4px;}}
.consensus-header .veto-reason{{color:#c62828;font-weight:600;margin-top:6px;}}
.judge-card{{background:#fff;border:1px solid #e0e0e0;border-radius:8px;padding:16px;margin-bottom:12px;}}
.judge-card.verdict-veto{{border-color:#ef9a9a;background:#fff5f5;}}
.coverage-notes{{background:#fff8e1;border:1px solid #ffecb3;border-radius:8px;padding:16px;margin-bottom:12px;font-size:13px;}}
.diagnostics-strip{{display:flex;gap:16px;font-size:12px;color:#888;margin-top:16px;}}
.run-error{{color:#c62828;font-weight:600;}}
.run-pending{{color:#888;}}
</style>
</head>
<body>
<div class="container">
<h1>{title}</h1>
{content}
</div>
</body>
</html>"#
    )
}
