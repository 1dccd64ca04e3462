use std::collections::HashMap;

pub struct I18n {
    translations: HashMap<String, HashMap<String, String>>,
    current_lang: String,
}

fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

const EN: &[(&str, &str)] = &[
    // Help texts
    ("help_about", "Operator console: runs shell commands on a PTY, records, classifies and redacts everything"),
    ("help_label_usage", "Usage:"),
    ("help_label_commands", "Commands:"),
    ("help_run", "Run one command inside an engagement"),
    ("help_shell", "Interactive line loop (cd, exit, any command)"),
    ("help_log", "Show the most recent records"),
    ("help_search", "Search commands, output or tags"),
    ("help_tag", "Tag the most recent record"),
    ("help_highlights", "Show extracted findings"),
    ("help_extract", "Extract findings from a file"),
    ("help_engagements", "List engagements"),
    ("help_status", "Engagement statistics"),
    ("help_record", "List, replay or export session recordings"),
    ("help_clean", "Delete all data of an engagement"),
    ("help_tip", "Run `redterm <COMMAND> --help` for the options of a command."),
    ("help_config_section", "Config ({0}):"),
    ("help_config_env", "REDTERM_HOME moves config and store, REDTERM_LOG sets the log filter"),
    // Errors
    ("error_open_store", "Failed to open the audit store"),
    ("error_save_execution", "Failed to save the execution record"),
    ("error_read_file", "Failed to read {0}"),
    ("error_load_recording", "Failed to load recording #{0}"),
    ("error_export", "Failed to export recording to {0}"),
    ("error_query", "Failed to query records"),
    ("error_engagement", "Invalid engagement"),
    // Command results
    ("command_succeeded", "Completed in {0} ms (exit code {1})"),
    ("command_failed", "Failed after {0} ms: {1}"),
    ("output_sanitized", "Sensitive values were masked in the stored output"),
    ("new_highlights", "{0} new finding(s) added to highlights"),
    ("record_saved", "Logged as #{0} in engagement {1}"),
    ("cd_failed", "cd failed: {0}"),
    // Recording
    ("recording_started", "Recording session for engagement {0}"),
    ("recording_saved", "Recording saved: {0}"),
    ("recording_cast", "Asciicast export: {0}"),
    ("recording_abandoned", "Recording discarded"),
    ("recording_kept", "Recording continues"),
    ("confirm_abandon_recording", "Interrupted. Type 'yes' to discard the current recording: "),
    ("interrupt_hint", "Interrupted. Type 'exit' to leave the shell."),
    ("shell_welcome", "redterm shell, engagement {0}. Type 'exit' to leave."),
    // Listings
    ("no_records", "No records found"),
    ("no_results", "No matches for {0}"),
    ("search_results", "{0} match(es) for {1}:"),
    ("tagged", "Tagged #{0}: {1}"),
    ("no_highlights", "No highlights yet"),
    ("highlights_title", "Highlights for {0} ({1} findings)"),
    ("extracted", "Extracted {0} finding(s) from {1}, {2} new"),
    ("engagements_title", "Engagements:"),
    ("no_engagements", "No engagements yet"),
    ("commands_count", "{0} commands"),
    ("last_activity", "last {0}"),
    ("never", "never"),
    ("status_title", "Engagement: {0}"),
    ("status_total", "Commands: {0} ({1} succeeded)"),
    ("status_success_rate", "Success rate: {0}%"),
    ("status_average", "Average duration: {0} ms"),
    ("status_highlights", "Highlights: {0}"),
    ("status_recordings", "Recordings: {0}"),
    ("status_last", "Last command: {0}"),
    ("recordings_title", "Recordings of {0}:"),
    ("no_recordings", "No recordings"),
    ("playback_interrupted", "Playback interrupted"),
    ("playback_done", "Playback finished"),
    ("exported", "Exported {0}"),
    // Clean
    ("clean_summary", "This deletes every record, highlight and recording of {0} ({1} commands)."),
    ("confirm_delete_prompt", "Type 'yes' to confirm: "),
    ("clean_aborted", "Aborted"),
    ("cleaned_records", "Cleaned {0} records"),
];

const ZH: &[(&str, &str)] = &[
    // 帮助文本
    ("help_about", "操作员控制台：在伪终端中执行命令，并记录、分类、脱敏所有输出"),
    ("help_label_usage", "用法:"),
    ("help_label_commands", "命令:"),
    ("help_run", "在项目中执行一条命令"),
    ("help_shell", "交互式命令循环（cd、exit 或任意命令）"),
    ("help_log", "显示最近的记录"),
    ("help_search", "搜索命令、输出或标签"),
    ("help_tag", "为最近一条记录添加标签"),
    ("help_highlights", "显示提取出的发现"),
    ("help_extract", "从文件中提取发现"),
    ("help_engagements", "列出所有项目"),
    ("help_status", "项目统计信息"),
    ("help_record", "列出、回放或导出会话录像"),
    ("help_clean", "删除项目的全部数据"),
    ("help_tip", "运行 `redterm <命令> --help` 查看命令选项。"),
    ("help_config_section", "配置 ({0}):"),
    ("help_config_env", "REDTERM_HOME 指定配置与存储目录，REDTERM_LOG 设置日志过滤"),
    // 错误
    ("error_open_store", "打开审计存储失败"),
    ("error_save_execution", "保存执行记录失败"),
    ("error_read_file", "读取 {0} 失败"),
    ("error_load_recording", "加载录像 #{0} 失败"),
    ("error_export", "导出录像到 {0} 失败"),
    ("error_query", "查询记录失败"),
    ("error_engagement", "无效的项目名"),
    // 执行结果
    ("command_succeeded", "执行完成，用时 {0} 毫秒（退出码 {1}）"),
    ("command_failed", "执行失败，用时 {0} 毫秒：{1}"),
    ("output_sanitized", "已保存的输出中的敏感信息已被屏蔽"),
    ("new_highlights", "新增 {0} 条发现"),
    ("record_saved", "已记录为项目 {1} 的 #{0}"),
    ("cd_failed", "切换目录失败：{0}"),
    // 录像
    ("recording_started", "开始录制项目 {0} 的会话"),
    ("recording_saved", "录像已保存：{0}"),
    ("recording_cast", "Asciicast 导出：{0}"),
    ("recording_abandoned", "录像已丢弃"),
    ("recording_kept", "继续录制"),
    ("confirm_abandon_recording", "已中断。输入 'yes' 丢弃当前录像："),
    ("interrupt_hint", "已中断。输入 'exit' 退出。"),
    ("shell_welcome", "redterm 交互模式，项目 {0}。输入 'exit' 退出。"),
    // 列表
    ("no_records", "未找到记录"),
    ("no_results", "没有匹配 {0} 的记录"),
    ("search_results", "{1} 共有 {0} 条匹配："),
    ("tagged", "已为 #{0} 添加标签：{1}"),
    ("no_highlights", "暂无发现"),
    ("highlights_title", "项目 {0} 的发现（共 {1} 条）"),
    ("extracted", "从 {1} 提取了 {0} 条发现，其中 {2} 条为新增"),
    ("engagements_title", "项目列表:"),
    ("no_engagements", "暂无项目"),
    ("commands_count", "{0} 条命令"),
    ("last_activity", "最近 {0}"),
    ("never", "从未"),
    ("status_title", "项目：{0}"),
    ("status_total", "命令数：{0}（成功 {1}）"),
    ("status_success_rate", "成功率：{0}%"),
    ("status_average", "平均用时：{0} 毫秒"),
    ("status_highlights", "发现：{0}"),
    ("status_recordings", "录像：{0}"),
    ("status_last", "最近命令：{0}"),
    ("recordings_title", "{0} 的录像："),
    ("no_recordings", "暂无录像"),
    ("playback_interrupted", "回放已中断"),
    ("playback_done", "回放结束"),
    ("exported", "已导出 {0}"),
    // 清理
    ("clean_summary", "将删除项目 {0} 的全部记录、发现和录像（{1} 条命令）。"),
    ("confirm_delete_prompt", "输入 'yes' 确认："),
    ("clean_aborted", "已取消"),
    ("cleaned_records", "已清理 {0} 条记录"),
];

impl I18n {
    pub fn new(lang: &str) -> Self {
        let mut translations = HashMap::new();
        translations.insert("en".to_string(), table(EN));
        translations.insert("zh".to_string(), table(ZH));

        // 确定语言 - 支持多种语言代码格式
        let effective_lang = if lang.starts_with("zh") || lang == "cn" || lang == "chinese" {
            "zh"
        } else {
            // 默认使用英文
            "en"
        };

        Self {
            translations,
            current_lang: effective_lang.to_string(),
        }
    }

    pub fn t(&self, key: &str) -> String {
        if let Some(lang_map) = self.translations.get(&self.current_lang) {
            if let Some(value) = lang_map.get(key) {
                return value.clone();
            }
        }
        key.to_string()
    }

    pub fn t_format(&self, key: &str, args: &[&str]) -> String {
        let mut result = self.t(key);
        for (i, arg) in args.iter().enumerate() {
            result = result.replace(&format!("{{{}}}", i), arg);
        }
        result
    }
}
